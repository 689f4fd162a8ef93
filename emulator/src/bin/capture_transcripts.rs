use std::io;

#[allow(dead_code)]
#[path = "../console.rs"]
mod console;
#[allow(dead_code)]
#[path = "../session.rs"]
mod session;
#[allow(dead_code)]
#[path = "../sim.rs"]
mod sim;

use session::{Session, TranscriptProfile};

fn main() -> io::Result<()> {
    record_profile(TranscriptProfile::Debug)?;
    record_profile(TranscriptProfile::Regulate)?;
    record_profile(TranscriptProfile::Stream)?;
    Ok(())
}

fn record_profile(profile: TranscriptProfile) -> io::Result<()> {
    let mut session = Session::new(profile)?;
    let script: &[&str] = match profile {
        TranscriptProfile::Debug => &[
            "state",
            "cont",
            "int",
            "state",
            "charge 2.9V",
            "discharge 2.6V",
            "int",
            "cont",
            "state",
            "status",
        ],
        TranscriptProfile::Regulate => &[
            "sense vcap",
            "set vcap 2.0",
            "status",
            "pwm period 2048",
            "set vcap 1.2",
            "pwm off",
            "set vboost 3.0",
            "reset",
        ],
        TranscriptProfile::Stream => &[
            "log begin vcap",
            "log begin vinj",
            "stream 3",
            "pwm high",
            "stream 2",
            "pwm off",
            "log end vinj",
            "stream",
            "log end vcap",
            "stream",
            "help log",
        ],
    };

    for line in script {
        let _ = session.handle_command(line)?;
    }
    Ok(())
}
