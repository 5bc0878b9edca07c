// hna-storage: the object-store boundary and the per-store image
// catalog sync.

pub mod object;
pub mod s3;
pub mod sync;
