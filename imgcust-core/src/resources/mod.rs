//! Scoped host resources: loop devices, mounts, image connections and chroot contexts.
//!
//! Every resource offers two releases. `close` is best-effort: failures are logged and the
//! call never fails, so it is safe on error paths and runs again on drop. `clean_close` (or
//! `detach` for loop devices) is strict and returns the first failure; the success path
//! uses it so a leaked mount is reported instead of ignored. Both are idempotent.

pub mod chroot;
pub mod connection;
pub mod loopback;
pub mod mount;

pub use chroot::ChrootContext;
pub use connection::ImageConnection;
pub use loopback::LoopbackDevice;
pub use mount::Mount;
