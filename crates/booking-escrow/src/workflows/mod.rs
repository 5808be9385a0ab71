pub mod booking;
pub mod checkin;
pub mod escrow;
pub mod policy;
pub mod rectification;
