use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "wager_locks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub duel_id: Uuid,
    #[sea_orm(primary_key, auto_increment = false)]
    pub player_id: i64,
    pub amount: i64,
    pub locked_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::duels::Entity",
        from = "Column::DuelId",
        to = "super::duels::Column::Id",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    Duels,
}

impl Related<super::duels::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Duels.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
