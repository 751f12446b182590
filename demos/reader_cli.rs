/*! Illustrative front-end for the reader library.

Exercises [`lofar_reader::session::Session`] against one or more raw-file
ports with a small hand-rolled flag set. This is not a re-implementation of
the full collaborator CLI surface (path templating, event files, clock
override, HDF5/sigproc metadata writers) — only enough to drive the reader
end-to-end from the command line for manual testing.
*/
use anyhow::Result;
use clap::Parser;
use log::info;

use lofar_reader::session::{Session, SessionConfig};
use lofar_reader::transport::ReaderType;

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// Raw-format input file, one per port.
    #[arg(required = true)]
    port_files: Vec<std::path::PathBuf>,

    /// Window size, in packets, per step.
    #[arg(long, default_value = "16")]
    packets_per_iteration: usize,

    /// Processing mode ID (see the processing kernels module).
    #[arg(long, default_value = "0")]
    processing_mode: u32,

    /// Replay the last valid packet on loss instead of zero-filling.
    #[arg(long)]
    replay_dropped_packets: bool,

    /// Number of steps to run before stopping.
    #[arg(long, default_value = "1")]
    steps: usize,

    /// Verbosity of debug messages.
    #[arg(short, default_value = "0")]
    verbose: usize,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("lofar_reader")
        .quiet(false)
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let mut config = SessionConfig::default();
    config.num_ports = opt.port_files.len();
    config.port_paths = opt.port_files;
    config.reader_type = ReaderType::Raw;
    config.packets_per_iteration = opt.packets_per_iteration;
    config.processing_mode = opt.processing_mode;
    config.replay_dropped_packets = opt.replay_dropped_packets;
    config.validate()?;

    let mut session = Session::setup(config)?;
    for i in 0..opt.steps {
        let (tolerable, timings) = session.step_timed()?;
        let outputs = session.outputs()?;
        info!(
            "step {i}: {tolerable:?}, read={:?}, kernel={:?}, outputs={}",
            timings[0],
            timings[1],
            outputs.len(),
        );
    }
    session.cleanup();
    Ok(())
}
