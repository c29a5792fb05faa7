// SPDX-License-Identifier: GPL-3.0-only

use storage_types::VolumeEvent;

/// Receiver of best-effort lifecycle notifications
///
/// `notify` must return promptly; implementations queue or drop, never wait.
pub trait VolumeListener: Send + Sync {
    fn notify(&self, event: VolumeEvent);
}
