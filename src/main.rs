use std::io::{self, BufRead, Write};

use anyhow::Result;
use log::*;

use memsim::simulator::{Response, Simulator, SimulatorConfig};

fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let mut simulator = Simulator::new(SimulatorConfig::default())?;
    let mut stdout = io::stdout();
    let mut lines = io::stdin().lock().lines();

    loop {
        print!("> ");
        stdout.flush()?;

        // End of input closes the session like `exit` does.
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match simulator.run_line(&line) {
            Ok(Response::Report(report)) => println!("{}", report),
            Ok(Response::Exit) => break,
            Err(error) => println!("{}", error),
        }
    }

    info!("Session closed.");
    Ok(())
}
