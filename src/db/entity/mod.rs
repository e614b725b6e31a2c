pub mod prelude;

pub mod duels;
pub mod player_accounts;
pub mod sea_orm_active_enums;
pub mod wager_locks;
