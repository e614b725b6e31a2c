pub use super::duels::Entity as Duels;
pub use super::player_accounts::Entity as PlayerAccounts;
pub use super::wager_locks::Entity as WagerLocks;
