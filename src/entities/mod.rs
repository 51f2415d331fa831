pub mod access_token;
pub mod client;
pub mod device_code;
pub mod session;
pub mod user;

pub use access_token::Entity as AccessToken;
pub use client::Entity as Client;
pub use device_code::Entity as DeviceCode;
pub use session::Entity as Session;
pub use user::Entity as User;
