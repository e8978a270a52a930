//! Stateless repositories. Every method takes a `&Connection` (a
//! `Transaction` derefs to one), so each call composes into whatever
//! transaction scope the caller opened.

pub mod call;
pub mod conversation;
pub mod device;
pub mod user;

pub use call::CallRepo;
pub use conversation::ConversationRepo;
pub use device::DeviceRepo;
pub use user::UserRepo;
