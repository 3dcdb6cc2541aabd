pub mod drivers;
pub mod locks;
pub mod offers;
pub mod orders;
