pub mod auth;
pub mod bookings;
pub mod saved_shops;
pub mod shops;
pub mod staff;
pub mod vehicles;
