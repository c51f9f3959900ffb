//! Writing images to block devices.

pub mod blkdev;
pub mod device;
pub mod writer;
