#![warn(missing_docs)]
/*! A multi-port LOFAR RSP packet reader and reformatting engine.

Ingests one raw UDP packet stream per RSP board ("port"), aligns them onto
a common packet timeline despite per-port packet loss, and reformats the
aligned samples through one of a closed set of processing kernels —
optionally multiplying by a time-varying polarimetric (Jones) matrix
supplied by an external calibration generator.

# Architecture overview

```text
  [ Transport  ] (C2, one per port)
        ↓
  [ Per-port buffer ] (C3)
        ↓
  [ Alignment engine ] (C4, setup/reuse only)
        ↓
  [ Reader orchestrator ] (C5)
        ↓
  [ Processing kernel ] (C6, + C7 calibration)
```

Unlike a dataflow graph of small composable blocks, the reader is a single
stateful session: ports don't run independently, they advance in lock-step
every `step()` so the kernel always sees a consistent window across all of
them. [`session::Session`] is the entry point most callers need; most never
touch [`reader::Reader`] directly.

# Example

```no_run
use lofar_reader::session::{Session, SessionConfig};

let mut config = SessionConfig::default();
config.port_paths = vec!["/data/port0.raw".into()];
config.packets_per_iteration = 16;

let mut session = Session::setup(config)?;
session.step()?;
let outputs = session.outputs()?;
println!("produced {} output planes", outputs.len());
session.cleanup();
# Ok::<(), lofar_reader::Error>(())
```
*/

pub mod align;
pub mod calibration;
pub mod constants;
pub mod error;
pub mod kernels;
pub mod packet;
pub mod port_buffer;
pub mod reader;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
pub use session::{Session, SessionConfig};

#[cfg(test)]
pub mod tests {
    //! Shared test helpers.

    /// Assert two float slices are equal within a small epsilon, the way
    /// floating-point Stokes output should be compared.
    pub fn assert_almost_equal_f32(left: &[f32], right: &[f32]) {
        assert_eq!(left.len(), right.len(), "\nleft: {left:?}\nright: {right:?}");
        for i in 0..left.len() {
            let dist = (left[i] - right[i]).abs();
            if dist > 1e-3 {
                assert_eq!(left[i], right[i], "\nElement {i}:\nleft: {left:?}\nright: {right:?}");
            }
        }
    }
}
