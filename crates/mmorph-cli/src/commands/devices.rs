//! Devices command
//!
//! Lists every device the session could open, in selection order.

use anyhow::Result;
use mmorph_compute::{DeviceClass, describe_devices, detect_devices, resolve_device};
use tracing::trace;

pub fn run(verbose: u8) -> Result<()> {
    trace!("devices::run");

    print!("{}", describe_devices());

    if verbose > 0 {
        let devices = detect_devices();
        for pref in [DeviceClass::Gpu, DeviceClass::Cpu] {
            match resolve_device(&devices, pref) {
                Ok(dev) => println!("{pref:>3} -> {}", dev.name),
                Err(e) => println!("{pref:>3} -> {e}"),
            }
        }
    }
    Ok(())
}
