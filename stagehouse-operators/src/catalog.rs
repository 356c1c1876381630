//! IMDb table catalog.
//!
//! The only place table names, column names, and column types are defined.
//! Staging tables mirror the columns of the public IMDb TSV dumps; the star
//! tables are projections of them populated by the transform stage.

use stagehouse_core::schema::{ColumnDef, ColumnType, TableSchema};

fn varchar(name: &str) -> ColumnDef {
    ColumnDef::new(name, ColumnType::Varchar(Some(255)))
}

fn text(name: &str) -> ColumnDef {
    ColumnDef::new(name, ColumnType::Varchar(None))
}

fn int(name: &str) -> ColumnDef {
    ColumnDef::new(name, ColumnType::Integer)
}

fn float(name: &str) -> ColumnDef {
    ColumnDef::new(name, ColumnType::Float)
}

fn boolean(name: &str) -> ColumnDef {
    ColumnDef::new(name, ColumnType::Boolean)
}

/// Staging tables, one per IMDb dump file.
pub fn staging_tables() -> Vec<TableSchema> {
    vec![
        TableSchema::new(
            "imdb_title_basics",
            vec![
                varchar("tconst").not_null(),
                varchar("titleType"),
                text("primaryTitle"),
                text("originalTitle"),
                int("isAdult"),
                int("startYear"),
                int("endYear"),
                int("runtimeMinutes"),
                varchar("genres"),
            ],
        )
        .with_primary_key(&["tconst"]),
        TableSchema::new(
            "imdb_title_ratings",
            vec![varchar("tconst").not_null(), float("averageRating"), int("numVotes")],
        )
        .with_primary_key(&["tconst"]),
        TableSchema::new(
            "imdb_title_crew",
            vec![varchar("tconst").not_null(), text("directors"), text("writers")],
        )
        .with_primary_key(&["tconst"]),
        TableSchema::new(
            "imdb_title_principals",
            vec![
                varchar("tconst").not_null(),
                int("ordering").not_null(),
                varchar("nconst"),
                varchar("category"),
                varchar("job"),
                text("characters"),
            ],
        )
        .with_primary_key(&["tconst", "ordering"]),
        TableSchema::new(
            "imdb_name_basics",
            vec![
                varchar("nconst").not_null(),
                varchar("primaryName"),
                int("birthYear"),
                int("deathYear"),
                varchar("primaryProfession"),
                varchar("knownForTitles"),
            ],
        )
        .with_primary_key(&["nconst"]),
        TableSchema::new(
            "imdb_title_episode",
            vec![
                varchar("tconst").not_null(),
                varchar("parentTconst"),
                int("seasonNumber"),
                int("episodeNumber"),
            ],
        )
        .with_primary_key(&["tconst"]),
    ]
}

/// A star table and the INSERT-SELECT that fills it from staging.
#[derive(Debug, Clone)]
pub struct Projection {
    pub table: TableSchema,
    /// Staging tables the select reads.
    pub sources: Vec<&'static str>,
    select: &'static str,
}

impl Projection {
    /// The SELECT body with `{staging}` bound to the staging schema.
    pub fn select_sql(&self, staging_schema: &str) -> String {
        self.select.replace("{staging}", staging_schema)
    }

    /// `INSERT INTO target (...) SELECT ...`.
    pub fn insert_sql(&self, target_schema: &str, staging_schema: &str) -> String {
        format!(
            "INSERT INTO {} ({})\n{}",
            self.table.qualified_name(target_schema),
            self.table.column_names().join(", "),
            self.select_sql(staging_schema)
        )
    }
}

const DIM_TITLE_SELECT: &str = "SELECT tconst, titleType, primaryTitle, originalTitle, isAdult = 1, startYear, endYear, runtimeMinutes, genres
FROM {staging}.imdb_title_basics
WHERE tconst IS NOT NULL";

const DIM_EPISODE_SELECT: &str = "SELECT tconst, parentTconst, seasonNumber, episodeNumber
FROM {staging}.imdb_title_episode
WHERE tconst IS NOT NULL";

const FACT_TITLE_RATING_SELECT: &str = "SELECT r.tconst, b.titleType, b.startYear, r.averageRating, r.numVotes
FROM {staging}.imdb_title_ratings r
JOIN {staging}.imdb_title_basics b ON b.tconst = r.tconst";

/// Star-schema projections, dimensions before facts.
pub fn star_projections() -> Vec<Projection> {
    vec![
        Projection {
            table: TableSchema::new(
                "dim_title",
                vec![
                    varchar("tconst").not_null(),
                    varchar("title_type"),
                    text("primary_title"),
                    text("original_title"),
                    boolean("is_adult"),
                    int("start_year"),
                    int("end_year"),
                    int("runtime_minutes"),
                    varchar("genres"),
                ],
            )
            .with_primary_key(&["tconst"]),
            sources: vec!["imdb_title_basics"],
            select: DIM_TITLE_SELECT,
        },
        Projection {
            table: TableSchema::new(
                "dim_episode",
                vec![
                    varchar("tconst").not_null(),
                    varchar("parent_tconst"),
                    int("season_number"),
                    int("episode_number"),
                ],
            )
            .with_primary_key(&["tconst"]),
            sources: vec!["imdb_title_episode"],
            select: DIM_EPISODE_SELECT,
        },
        Projection {
            table: TableSchema::new(
                "fact_title_rating",
                vec![
                    varchar("tconst").not_null(),
                    varchar("title_type"),
                    int("start_year"),
                    float("average_rating"),
                    int("num_votes"),
                ],
            )
            .with_primary_key(&["tconst"]),
            sources: vec!["imdb_title_ratings", "imdb_title_basics"],
            select: FACT_TITLE_RATING_SELECT,
        },
    ]
}

pub fn star_tables() -> Vec<TableSchema> {
    star_projections().into_iter().map(|p| p.table).collect()
}

/// Look up any catalog table by name.
pub fn lookup(name: &str) -> Option<TableSchema> {
    staging_tables()
        .into_iter()
        .chain(star_tables())
        .find(|t| t.name == name)
}

pub fn is_star_table(name: &str) -> bool {
    star_projections().iter().any(|p| p.table.name == name)
}
