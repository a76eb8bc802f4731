use std::error::Error;
use std::thread;
use std::time::Duration;

use log::{error, info};

use rtap::{list_devices, Settings, Tap, TapTable};

fn main() -> Result<(), Box<dyn Error>> {
    let settings = Settings::new()?;

    env_logger::Builder::new()
        .parse_filters(&settings.log_level)
        .init();

    settings.validate()?;

    // Load the listeners, rules, chains and devices to set up
    info!("Loading tap table from '{}'", &settings.table_file_path);
    let table = TapTable::load(&settings.table_file_path)?;

    info!("Finding network devices...");
    match list_devices() {
        Ok(devices) => {
            for device in &devices {
                info!("  {}", device.name);
            }
        }
        Err(e) => error!("Could not list devices: {}", e),
    }

    let tap = Tap::new(settings.pool_capacity, settings.capture.clone())?;
    if let Err(e) = tap.apply(&table) {
        error!("Failed to apply tap table: {}", e);
        tap.shutdown();
        return Err(e.into());
    }

    // Devices capture and forward on their own threads; this one reports.
    let interval = Duration::from_secs(settings.report_interval_secs.max(1));
    loop {
        thread::sleep(interval);
        info!("\n{}", tap.report());
    }
}
