// Loom - governed knowledge-substrate pipeline
//
// Raw captures flow through cooperating pipeline stages (P0 capture, P1
// substrate, optional P2 graph, P3 reflection, P4 composition) into
// versioned substrate inside per-workspace baskets. Every substrate
// mutation is proposed, validated, and committed through governance; no
// agent writes substrate directly.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod orchestrator;
pub mod testing;

pub use config::{Config, OrchestratorConfig};
pub use orchestrator::{CaptureReceipt, CaptureRequest, Orchestrator, OrchestratorHandle};
