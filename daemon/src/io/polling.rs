//! Polling I/O.
//!
//! Identical to Default, except that filesystem-event auto-import is
//! declined: some network filesystems never deliver reliable change
//! notification, so the update loop falls back to periodic catch-up
//! scans for these nodes.

use std::sync::Arc;

use super::default::DefaultNodeIO;
use super::{NodeIO, NodeIoCtx};
use crate::error::DaemonResult;

pub fn new_polling_node_io(ctx: NodeIoCtx) -> DaemonResult<Arc<dyn NodeIO>> {
    DefaultNodeIO::with_events(ctx, false)
}
