use anyhow::Context;
use csv_log::CsvLog;
use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use source::HistoryFilter;

mod csv_log;
mod reading;
mod source;

const DEVICE_ADDRESS: &str = "E3:99:D5:D6:06:CA";
const ENTRY_FILTER: HistoryFilter = HistoryFilter { last: 250 };

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    TermLogger::init(
        LevelFilter::Info,
        ConfigBuilder::new()
            .set_time_format_rfc3339()
            .set_time_offset_to_local()
            .map_err(|_| anyhow::anyhow!("Failed to set time offset to local"))?
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("Failed to initialize logger")?;

    if let Err(e) = run().await {
        log::error!("{e:#}");
        std::process::exit(1);
    }

    Ok(())
}

pub async fn run() -> Result<(), anyhow::Error> {
    let readings = source::fetch_history(DEVICE_ADDRESS, &ENTRY_FILTER).await?;

    let history = CsvLog::new(csv_log::default_path()?);
    history.append_new(&readings)?;

    Ok(())
}
