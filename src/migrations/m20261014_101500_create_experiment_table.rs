use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Experiment::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Experiment::Id)
                            .integer()
                            .auto_increment()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Experiment::Guid)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Experiment::Workload).string().not_null())
                    .col(
                        ColumnDef::new(Experiment::Note)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Experiment::Config).text().not_null())
                    .col(ColumnDef::new(Experiment::StartTime).big_integer().not_null())
                    .col(ColumnDef::new(Experiment::StopTime).big_integer())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Experiment::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Experiment {
    Table,
    Id,
    Guid,
    Workload,
    Note,
    Config,
    StartTime,
    StopTime,
}
