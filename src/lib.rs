// Soorma - infrastructure services for distributed agent orchestration
//
// Three cooperating services let long-lived worker agents discover one
// another, exchange event envelopes over a pluggable bus, and share durable
// state across multi-step plans:
// - Event Service (gateway): HTTP publish + SSE fan-out over a bus adapter
// - Registry Service: event/agent definitions with heartbeat TTL liveness
// - Memory Service: working/episodic/semantic/procedural memory and the
//   plan/task records the orchestration contracts run on
//
// Agent processes link against this crate for the `sdk` module only; the
// services run from the `soorma` binary.

pub mod bus;
pub mod cli;
pub mod config;
pub mod embeddings;
pub mod events;
pub mod gateway;
pub mod memory;
pub mod registry;
pub mod sdk;

pub(crate) mod util;
