pub mod booking;
pub mod notification;
pub mod ticket;

pub use self::{
    booking::{BookingRequest, Issued},
    notification::{Acknowledgement, Notification},
    ticket::Ticket,
};
