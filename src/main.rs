use std::env::args;
use std::str::FromStr;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

const DEFAULT_WORKERS: usize = 3;

fn main() -> Result<(), String> {
    handshake_phaser::logging::init();

    let mut args = args().skip(1);
    let demo = args.next().ok_or(format!(
        "no demo supplied, use one of {} or see unit tests",
        Demo::iter()
            .map(|d| d.to_string())
            .collect::<Vec<String>>()
            .join(",")
    ))?;
    let demo = Demo::from_str(&demo).map_err(|e| format!("{e}: `{demo}'"))?;

    match demo {
        Demo::Handshake => handshake_phaser::monitor::run(),
        Demo::Phases => {
            let workers = args
                .next()
                .map(|w| {
                    usize::from_str(&w).map_err(|e| format!("bad number of workers `{w}': {e}"))
                })
                .transpose()?
                .unwrap_or(DEFAULT_WORKERS);
            handshake_phaser::phase_barrier::run(workers)
        }
    }
    Ok(())
}

#[derive(EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
enum Demo {
    Handshake,
    Phases,
}
