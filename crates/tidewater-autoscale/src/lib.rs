//! tidewater-autoscale — capacity-event driven fleet scaling.
//!
//! Each capacity-change event for a worker refreshes the cluster's
//! resource snapshot and re-evaluates whether the fleet can still place
//! the largest task any service on the cluster may ask for.
//!
//! # Scaling Algorithm
//!
//! ```text
//! worst = (max cpu reservation, max memory reservation) over the cluster's services
//!
//! if desired < max:
//!     zone fits  = some non-draining instance has free cpu > worst.cpu
//!                  and free memory > worst.memory
//!     if any zone does not fit and no scaling in the cooldown window:
//!         desired + 1
//!
//! if every zone fits and desired > min:
//!     needed.memory = registered.memory + worst.memory + ceil(worst.memory * buffer)
//!     needed.cpu    = registered.cpu + worst.cpu
//!     if every zone's summed free capacity >= needed
//!        and no scaling in the cooldown window:
//!         desired - 1
//! ```
//!
//! The snapshot and the chosen action are persisted after every event. A
//! fleet that already sits on a bound makes the mutation a no-op.

pub mod error;
pub mod scaler;

pub use error::{ScaleError, ScaleResult};
pub use scaler::{ScaleDecision, ScalingEngine, WorstCase, evaluate};
