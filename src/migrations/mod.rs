pub mod m20261014_101500_create_experiment_table;
pub mod m20261014_101510_create_sample_table;

pub use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261014_101500_create_experiment_table::Migration),
            Box::new(m20261014_101510_create_sample_table::Migration),
        ]
    }
}
