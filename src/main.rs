//! Small diagnostic tool: load a `.cor` calibration file and print its
//! envelope plus a spot-check interpolation at its center point.
//!
//! Not a feature of the driver itself (CLI front-ends are out of scope for
//! this crate) — just enough to exercise [`balor::Calibration`] without a
//! board attached.

use std::env;
use std::fs;

use balor::Calibration;

fn main() {
    balor::logger::init();

    let path = match env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("usage: balor-cal-dump <path-to-.cor-file>");
            std::process::exit(2);
        }
    };

    let text = match fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) => {
            log::error!("failed to read {path}: {e}");
            std::process::exit(1);
        }
    };

    let calibration = match Calibration::from_cor_str(&text) {
        Ok(c) => c,
        Err(e) => {
            log::error!("failed to parse {path}: {e}");
            std::process::exit(1);
        }
    };

    let (x_min, x_max, y_min, y_max) = calibration.envelope().expect("file-backed calibration has an envelope");
    println!("envelope: x=[{x_min}, {x_max}] y=[{y_min}, {y_max}]");

    let (cx, cy) = ((x_min + x_max) / 2.0, (y_min + y_max) / 2.0);
    match calibration.interpolate(cx, cy) {
        Ok((gx, gy)) => println!("center ({cx}, {cy}) mm -> galvo (0x{gx:04x}, 0x{gy:04x})"),
        Err(e) => log::error!("interpolation failed: {e}"),
    }
}
