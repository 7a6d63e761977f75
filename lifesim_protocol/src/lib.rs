// lifesim_protocol: wire protocol for the multiplayer session layer.
//
// This crate defines the message vocabulary, value types and framing used by
// the host and its peers (`lifesim_session`) to talk over TCP. It is shared by
// both roles and has no dependency on the simulation.
//
// Module overview:
// - `types.rs`:    `LogicalTime`, the opaque `AttributeBag`, and participant
//                  `Archetype`s with their behaviour coefficients.
// - `message.rs`:  The closed `Message` enum, one variant per wire tag.
// - `framing.rs`:  4-byte big-endian length prefix + JSON payload, blocking
//                  `read_frame`/`write_frame`, and the incremental
//                  `FrameDecoder` used by timeout-driven receive loops.
//
// Design decisions:
// - **JSON payloads.** Self-describing and easy to inspect; the bags are small.
// - **One enum for both directions.** Every tag has a fixed payload shape, and
//   the session layer gates which tags are meaningful per role and phase.
// - **No async runtime.** Blocking `std::io` only; every connection has its
//   own OS thread in the session layer.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{
    CodecError, FrameDecoder, MAX_FRAME_SIZE, decode, encode, read_frame, write_frame,
};
pub use message::Message;
pub use types::{ARCHETYPE_KEY, Archetype, AttrValue, AttributeBag, Coefficients, LogicalTime};
