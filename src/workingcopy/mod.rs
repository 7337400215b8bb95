//! The working-copy engines: side tables and triggers (`schema`), the diff
//! engine shared by checkout and commit (`diff`), checkout (`checkout`), the
//! commit engine (`commit`), and the integrity verifier (`fsck`).

mod checkout;
mod commit;
mod diff;
mod fsck;
mod schema;

pub use checkout::{checkout_new, checkout_update};
pub use commit::commit;
pub use diff::{working_copy_diff, FeatureChange, MetaChange};
pub use fsck::{fsck, reset_layer, FsckReport};
