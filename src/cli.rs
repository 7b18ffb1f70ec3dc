//! `mstat` command line: evaluate configured statistics against a SQLite
//! database.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde_json::json;

use crate::config::StatsConfig;
use crate::stats::query::Record;
use crate::stats::registry::{StatisticRegistry, StatisticsCatalog};
use crate::stats::sqlite::SqliteBackend;
use crate::stats::types::{FilterValue, Filters, SqlValue, StatValue};

#[derive(Parser, Debug)]
#[command(name = "mstat", version, about = "Named, cached aggregate statistics over SQLite tables")]
pub struct Cli {
    /// SQLite database to query
    #[arg(long, global = true, env = "MSTAT_DB")]
    pub db: Option<PathBuf>,

    /// Statistics config file (defaults to $MSTAT_CONFIG or the user config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Model to use; may be omitted when the config declares exactly one
    #[arg(long, short, global = true)]
    pub model: Option<String>,

    /// Output machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// List statistic names in declaration order
    Names,
    /// Evaluate one statistic, using the cache when configured
    Get {
        name: String,
        /// Filter as key=value (repeatable)
        #[arg(long = "filter", short, value_parser = parse_filter)]
        filters: Vec<(String, FilterValue)>,
    },
    /// Evaluate one statistic, bypassing and refreshing the cache
    Fresh {
        name: String,
        #[arg(long = "filter", short, value_parser = parse_filter)]
        filters: Vec<(String, FilterValue)>,
    },
    /// Evaluate every statistic of the model
    All {
        #[arg(long = "filter", short, value_parser = parse_filter)]
        filters: Vec<(String, FilterValue)>,
        /// Statistic to leave out
        #[arg(long)]
        except: Option<String>,
    },
    /// Print the SQL selecting the rows behind a statistic
    Sql {
        name: String,
        #[arg(long = "filter", short, value_parser = parse_filter)]
        filters: Vec<(String, FilterValue)>,
    },
    /// Print the rows behind a statistic
    Rows {
        name: String,
        #[arg(long = "filter", short, value_parser = parse_filter)]
        filters: Vec<(String, FilterValue)>,
        /// Maximum rows to print
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

/// Parse `key=value`, inferring the value's type.
pub fn parse_filter(raw: &str) -> Result<(String, FilterValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty filter key in `{raw}`"));
    }
    Ok((key.to_string(), FilterValue::infer(value)))
}

fn to_filters(pairs: &[(String, FilterValue)]) -> Filters {
    pairs.iter().cloned().collect()
}

pub fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => StatsConfig::load_from(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StatsConfig::load().context("loading default config")?,
    };
    let command = cli.command.clone().unwrap_or(Commands::Names);

    let model = resolve_model(&config, cli.model.as_deref())?;
    let backend = match &cli.db {
        Some(path) => SqliteBackend::open(path)
            .with_context(|| format!("opening database {}", path.display()))?,
        None if command == Commands::Names => {
            SqliteBackend::open_in_memory().context("opening in-memory database")?
        }
        None => bail!("no database given; pass --db or set MSTAT_DB"),
    };
    let catalog = config
        .build_catalog(Arc::new(backend))
        .context("building statistics catalog")?;
    let registry = registry_for(&catalog, &model)?;

    match command {
        Commands::Names => {
            if cli.json {
                println!("{}", json!({ "model": model, "statistics": registry.names() }));
            } else {
                for name in registry.names() {
                    println!("{name}");
                }
            }
        }
        Commands::Get { name, filters } => {
            let filters = to_filters(&filters);
            let value = registry
                .get(&name, &filters)
                .with_context(|| format!("evaluating `{name}`"))?
                .ok_or_else(|| anyhow!("unknown statistic `{name}` on model `{model}`"))?;
            print_value(cli.json, &name, value);
        }
        Commands::Fresh { name, filters } => {
            let filters = to_filters(&filters);
            let value = registry
                .get_fresh(&name, &filters)
                .with_context(|| format!("evaluating `{name}`"))?
                .ok_or_else(|| anyhow!("unknown statistic `{name}` on model `{model}`"))?;
            print_value(cli.json, &name, value);
        }
        Commands::All { filters, except } => {
            let filters = to_filters(&filters);
            let values = registry
                .all(&filters, except.as_deref())
                .context("evaluating statistics")?;
            if cli.json {
                let map: serde_json::Map<String, serde_json::Value> = values
                    .iter()
                    .map(|(name, value)| (name.clone(), json!(value)))
                    .collect();
                println!("{}", serde_json::Value::Object(map));
            } else {
                for (name, value) in values {
                    println!("{name}: {value}");
                }
            }
        }
        Commands::Sql { name, filters } => {
            let filters = to_filters(&filters);
            let collection = registry
                .query_for(&name, &filters)
                .with_context(|| format!("building query for `{name}`"))?
                .ok_or_else(|| anyhow!("`{name}` is not an aggregate statistic of `{model}`"))?;
            if cli.json {
                println!("{}", json!({ "statistic": name, "sql": collection.to_sql() }));
            } else {
                println!("{}", collection.to_sql());
            }
        }
        Commands::Rows {
            name,
            filters,
            limit,
        } => {
            let filters = to_filters(&filters);
            let collection = registry
                .query_for(&name, &filters)
                .with_context(|| format!("building query for `{name}`"))?
                .ok_or_else(|| anyhow!("`{name}` is not an aggregate statistic of `{model}`"))?;
            let rows = collection.records().context("fetching rows")?;
            print_rows(cli.json, &rows[..rows.len().min(limit)]);
        }
    }
    Ok(())
}

fn resolve_model(config: &StatsConfig, requested: Option<&str>) -> Result<String> {
    match (requested, config.models.as_slice()) {
        (Some(name), _) => {
            if config.find_model(name).is_none() {
                bail!("model `{name}` is not declared in the config");
            }
            Ok(name.to_string())
        }
        (None, [only]) => Ok(only.name.clone()),
        (None, []) => bail!("the config declares no models"),
        (None, models) => {
            let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
            bail!("several models declared ({}); pick one with --model", names.join(", "))
        }
    }
}

fn registry_for<'a>(catalog: &'a StatisticsCatalog, model: &str) -> Result<&'a StatisticRegistry> {
    catalog
        .registry(model)
        .ok_or_else(|| anyhow!("model `{model}` has no registry"))
}

fn print_value(json_out: bool, name: &str, value: StatValue) {
    if json_out {
        println!("{}", json!({ "statistic": name, "value": value }));
    } else {
        println!("{value}");
    }
}

fn print_rows(json_out: bool, rows: &[Record]) {
    if json_out {
        println!("{}", json!(rows));
        return;
    }
    for row in rows {
        let cells: Vec<String> = row
            .iter()
            .map(|(column, value)| format!("{column}={}", display_cell(value)))
            .collect();
        println!("{}", cells.join("\t"));
    }
}

fn display_cell(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(v) => v.to_string(),
        SqlValue::Real(v) => v.to_string(),
        SqlValue::Text(s) => s.clone(),
    }
}
