//! In-process replica harness
//!
//! Runs several real nodes on ephemeral localhost ports so replication can be
//! tested end to end over TCP on a single machine.
//!
//! A replica is a full `Node` with its own key and storage, reached through
//! the same `Client` a user would use. `SmoothReplicaBatch` links replicas
//! into a full mesh; the `await_*` helpers poll until links are up or values
//! agree, failing after a timeout.
//!
//! ```no_run
//! use bftkv_core::smoothtest::{await_batch_convergence, SmoothReplicaBatch};
//! use bftkv_core::CrdtType;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let batch = SmoothReplicaBatch::new(3).await?;
//! batch.connect_all().await?;
//!
//! let mut alice = batch[0].client().await?;
//! let key = alice.new_key(CrdtType::Counter).await?;
//! alice.inc(key, 5).await?;
//!
//! let value = await_batch_convergence(5, &batch, key).await?;
//! assert_eq!(value.as_counter(), Some(5));
//! # Ok(())
//! # }
//! ```

mod consistency;
mod smooth_batch;
mod smooth_replica;

pub use consistency::{await_batch_convergence, await_convergence, await_peers};
pub use smooth_batch::SmoothReplicaBatch;
pub use smooth_replica::SmoothReplica;
