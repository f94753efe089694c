//! Errno values used in message replies.
//!
//! Replies on a message port carry a signed status: a byte count on success
//! or the negation of one of these values on failure.

#![allow(dead_code)]

pub const EPERM: i32 = 1; /* Operation not permitted */
pub const EINTR: i32 = 4; /* Interrupted system call */
pub const EIO: i32 = 5; /* I/O error */
pub const ENXIO: i32 = 6; /* No such device or address */
pub const E2BIG: i32 = 7; /* Argument list too long */
pub const EBADF: i32 = 9; /* Bad file number */
pub const EAGAIN: i32 = 11; /* Try again */
pub const ENOMEM: i32 = 12; /* Out of memory */
pub const EFAULT: i32 = 14; /* Bad address */
pub const EBUSY: i32 = 16; /* Device or resource busy */
pub const ENODEV: i32 = 19; /* No such device */
pub const EINVAL: i32 = 22; /* Invalid argument */
pub const ENOTTY: i32 = 25; /* Not a typewriter */
pub const ENOSPC: i32 = 28; /* No space left on device */
pub const EROFS: i32 = 30; /* Read-only file system */
pub const ERANGE: i32 = 34; /* Math result not representable */
pub const ENOSYS: i32 = 38; /* Function not implemented */
pub const ENOTSUP: i32 = 95; /* Operation not supported */
pub const ETIMEDOUT: i32 = 110; /* Connection timed out */
