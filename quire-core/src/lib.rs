//! Quire Core: the text operation model shared by server and clients.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   apply / inverse   ┌──────────────┐
//! │  Operation   │ ──────────────────► │   String     │
//! │ Insert|Delete│                     │ (char offs.) │
//! └──────┬───────┘                     └──────┬───────┘
//!        │ transform(my, other)               │ newline deltas
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ Transformed  │                     │  LineIndex   │
//! │ Vanished|One │                     │ line → offset│
//! │ |Split       │                     └──────────────┘
//! └──────────────┘
//! ```
//!
//! Everything here is pure: no I/O, no locks, no clocks. The server uses
//! [`Operation::apply`] and [`LineIndex`] as a strict sequencer; clients
//! additionally run [`transform`] and [`transform_sequences`] to rebase
//! their optimistic edits.
//!
//! Reference: Ellis & Gibbs, Concurrency Control in Groupware Systems (1989)

pub mod lines;
pub mod op;
pub mod transform;

pub use lines::LineIndex;
pub use op::{OpError, OpIdGenerator, OpKind, Operation};
pub use transform::{transform, transform_position, transform_sequences, Transformed};
