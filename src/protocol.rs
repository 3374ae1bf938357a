mod key;
mod record;
mod tunnel_id;

pub use key::MappingKey;
pub use record::{resolve_target, AddressError, MappingRecord};
pub use tunnel_id::{TunnelId, TunnelIdError, MAX_TUNNEL_ID_LEN};
