use super::sea_orm_active_enums::DuelStatus;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "duels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub participant_a: i64,
    pub participant_b: i64,
    pub wager: i64,
    pub status: DuelStatus,
    pub winner: Option<i64>,
    pub created_at: DateTimeWithTimeZone,
    pub resolved_at: Option<DateTimeWithTimeZone>,
    pub version: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::wager_locks::Entity")]
    WagerLocks,
}

impl Related<super::wager_locks::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WagerLocks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
