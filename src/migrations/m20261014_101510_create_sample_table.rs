use super::m20261014_101500_create_experiment_table::Experiment;
use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Sample::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sample::Id)
                            .integer()
                            .auto_increment()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Sample::ExperimentGuid).string().not_null())
                    .col(ColumnDef::new(Sample::Seq).big_integer().not_null())
                    .col(ColumnDef::new(Sample::Body).text().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .from(Sample::Table, Sample::ExperimentGuid)
                            .to(Experiment::Table, Experiment::Guid),
                    )
                    // unique constraint
                    .index(
                        Index::create()
                            .col(Sample::ExperimentGuid)
                            .col(Sample::Seq)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Sample::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Sample {
    Table,
    Id,
    ExperimentGuid,
    Seq,
    Body,
}
