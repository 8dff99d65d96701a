//! XREDS.
//!
//! A web service that serves gridded environmental datasets (model output, forecasts and
//! observations stored as zarr or kerchunk references) without reopening them for every request.
//! Loaded datasets are cached per process and, optionally, in a cache shared between processes.

#![warn(
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
