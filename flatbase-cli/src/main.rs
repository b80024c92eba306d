use clap::{Parser, Subcommand, ValueEnum};
use flatbase::{
    cancel_pair, AggregateFunction, AggregateRequest, AggregateSpec, BulkOperationRequest,
    CancelToken, FieldDefinition, FieldType, FileWatcher, Filter, QueryOptions, Store,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::error::Error;
use std::io::Read;
use std::process;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

/// flatbase CLI: query and edit flat-file collections from the command line
#[derive(Parser)]
#[command(name = "flatbase", version, about)]
struct Cli {
    /// Path to the data directory (default: current directory)
    #[arg(long, env = "FLATBASE_DATA_DIR", default_value = ".")]
    data_dir: String,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// List collection names
    Collections,

    /// Show the inferred schema of a collection
    Schema {
        /// Collection name
        collection: String,
    },

    /// List records with filtering, sorting and paging
    List {
        /// Collection name
        collection: String,
        /// Equality filters (e.g. --where status=open)
        #[arg(long = "where", value_parser = parse_key_value)]
        conditions: Vec<(String, String)>,
        /// Filter as JSON (e.g. --filter '{"age": {"$gt": 30}}')
        #[arg(long)]
        filter: Option<String>,
        /// Sort as field, field:asc or field:desc
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Comma-separated projection (id is always included)
        #[arg(long, value_delimiter = ',')]
        fields: Option<Vec<String>>,
    },

    /// Get a single record by ID
    Get {
        /// Collection name
        collection: String,
        /// Record ID
        id: String,
    },

    /// Create a new record
    Create {
        /// Collection name
        collection: String,
        /// Field values (e.g. --field name="Alice Chen")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Update fields of an existing record
    Update {
        /// Collection name
        collection: String,
        /// Record ID
        id: String,
        /// Field values to update (e.g. --field status=closed)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete a record
    Delete {
        /// Collection name
        collection: String,
        /// Record ID
        id: String,
        /// Show what would be deleted without actually deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a bulk request read from a JSON file ("-" for stdin)
    Bulk {
        /// Collection name
        collection: String,
        /// Path to the request body
        request: String,
    },

    /// Count records per value of a field
    Summary {
        /// Collection name
        collection: String,
        /// Field to group by
        field: String,
    },

    /// Group and aggregate records
    Aggregate {
        /// Collection name
        collection: String,
        /// Comma-separated group-by fields
        #[arg(long, value_delimiter = ',')]
        group_by: Option<Vec<String>>,
        /// Aggregates as function:field[:alias] (e.g. --agg sum:amount:total)
        #[arg(long = "agg", value_parser = parse_aggregate, required = true)]
        aggregates: Vec<AggregateSpec>,
        /// Filter as JSON
        #[arg(long)]
        filter: Option<String>,
    },

    /// Create an empty collection with declared fields
    Init {
        /// Collection name
        collection: String,
        /// Field declarations (e.g. --field price=float)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Fields that may not be null
        #[arg(long)]
        required: Vec<String>,
    },

    /// Replace a collection with the contents of a file
    Import {
        /// Collection name
        collection: String,
        /// Path to the file ("-" for stdin)
        file: String,
    },

    /// Print changes made to collection files by other processes
    Watch,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s.find('=').ok_or_else(|| {
        format!("Invalid key=value pair: no '=' found in '{s}'")
    })?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_aggregate(s: &str) -> Result<AggregateSpec, String> {
    let mut parts = s.splitn(3, ':');
    let function = parts.next().unwrap_or_default();
    let function: AggregateFunction = serde_json::from_value(json!(function))
        .map_err(|_| format!("Unknown aggregate function '{function}'"))?;
    let field = parts.next().unwrap_or_default().to_string();
    let alias = parts.next().map(str::to_string);
    Ok(AggregateSpec {
        field,
        function,
        alias,
    })
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let store = Store::open(&cli.data_dir)?;

    let (handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    match cli.command {
        Command::Collections => {
            let names = store.list_collections(&cancel).await?;
            print_output(&names, &cli.format)?;
        }

        Command::Schema { collection } => {
            let schema = store.get_schema(&collection, &cancel).await?;
            print_output(&schema, &cli.format)?;
        }

        Command::List {
            collection,
            conditions,
            filter,
            sort,
            limit,
            offset,
            fields,
        } => {
            let options = QueryOptions {
                fields,
                filter: build_filter(filter.as_deref(), &conditions)?,
                limit,
                offset,
                sort,
            };
            let result = store.list(&collection, &options, &cancel).await?;
            print_output(&result, &cli.format)?;
        }

        Command::Get { collection, id } => {
            let record = store.get(&collection, &id, &cancel).await?;
            print_output(&record, &cli.format)?;
        }

        Command::Create { collection, fields } => {
            let data = fields_to_map(&fields);
            let result = store.create(&collection, &data, &cancel).await?;
            print_output(&result, &cli.format)?;
        }

        Command::Update {
            collection,
            id,
            fields,
        } => {
            let data = fields_to_map(&fields);
            let record = store.update(&collection, &id, &data, &cancel).await?;
            print_output(&record, &cli.format)?;
        }

        Command::Delete {
            collection,
            id,
            dry_run,
        } => {
            if dry_run {
                let record = store.get(&collection, &id, &cancel).await?;
                print_output(
                    &json!({
                        "dry_run": true,
                        "would_delete": { "collection": collection, "id": id },
                        "record": record,
                    }),
                    &cli.format,
                )?;
            } else {
                store.delete(&collection, &id, &cancel).await?;
                print_output(&json!({ "ok": true, "deleted": id }), &cli.format)?;
            }
        }

        Command::Bulk {
            collection,
            request,
        } => {
            let body: Value = serde_json::from_slice(&read_input(&request)?)?;
            let request = BulkOperationRequest::from_value(&body)?;
            let result = store.bulk_operation(&collection, &request, &cancel).await?;
            print_output(&result, &cli.format)?;
        }

        Command::Summary { collection, field } => {
            let summary = store.get_summary(&collection, &field, &cancel).await?;
            print_output(&summary, &cli.format)?;
        }

        Command::Aggregate {
            collection,
            group_by,
            aggregates,
            filter,
        } => {
            let request = AggregateRequest {
                group_by,
                aggregates,
                filter: build_filter(filter.as_deref(), &[])?,
            };
            let result = store.aggregate(&collection, &request, &cancel).await?;
            print_output(&result, &cli.format)?;
        }

        Command::Init {
            collection,
            fields,
            required,
        } => {
            let definitions = field_definitions(&fields, &required)?;
            let schema = store
                .create_collection(&collection, definitions, &cancel)
                .await?;
            print_output(&schema, &cli.format)?;
        }

        Command::Import { collection, file } => {
            let bytes = read_input(&file)?;
            let count = store.import_collection(&collection, &bytes, &cancel).await?;
            print_output(
                &json!({ "ok": true, "collection": collection, "records": count }),
                &cli.format,
            )?;
        }

        Command::Watch => watch(&store, &cancel, &cli.format)?,
    }

    Ok(())
}

fn watch(store: &Store, cancel: &CancelToken, format: &OutputFormat) -> Result<(), Box<dyn Error>> {
    let watcher = FileWatcher::start(store.data_dir(), &store.config().extension)?;
    log::info!("Watching {}", store.data_dir().display());

    while !cancel.is_cancelled() {
        let next = tokio::task::block_in_place(|| {
            watcher.event_rx.recv_timeout(Duration::from_millis(250))
        });
        match next {
            Ok(event) => {
                store.apply_watcher_event(&event);
                print_output(
                    &json!({ "collection": event.collection, "kind": format!("{:?}", event.kind) }),
                    format,
                )?;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn print_output<T: Serialize>(value: &T, format: &OutputFormat) -> Result<(), Box<dyn Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value)?);
        }
    }
    Ok(())
}

fn fields_to_map(fields: &[(String, String)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, val) in fields {
        // Try to parse as JSON value (for numbers, booleans, arrays, objects)
        let json_val = serde_json::from_str(val).unwrap_or(Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    map
}

/// Combine a JSON filter with `--where` equality conditions.
fn build_filter(
    filter: Option<&str>,
    conditions: &[(String, String)],
) -> Result<Option<Filter>, Box<dyn Error>> {
    let mut clauses = Vec::new();
    if let Some(text) = filter {
        let value: Value = serde_json::from_str(text)?;
        clauses.push(Filter::parse(&value)?);
    }
    for (field, value) in fields_to_map(conditions) {
        clauses.push(Filter::eq(field, value));
    }
    Ok(match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(Filter::And(clauses)),
    })
}

fn field_definitions(
    fields: &[(String, String)],
    required: &[String],
) -> Result<Vec<FieldDefinition>, Box<dyn Error>> {
    let mut definitions = Vec::with_capacity(fields.len());
    for (name, type_name) in fields {
        let field_type: FieldType = serde_yaml::from_str(type_name)
            .map_err(|_| format!("Unknown field type '{type_name}' for '{name}'"))?;
        let mut definition = FieldDefinition::new(name.clone(), field_type);
        if required.contains(name) {
            definition = definition.required();
        }
        definitions.push(definition);
    }
    for name in required {
        if !fields.iter().any(|(field, _)| field == name) {
            return Err(format!("Required field '{name}' has no --field declaration").into());
        }
    }
    Ok(definitions)
}

fn read_input(path: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    if path == "-" {
        let mut content = Vec::new();
        std::io::stdin().read_to_end(&mut content)?;
        Ok(content)
    } else {
        std::fs::read(path).map_err(|e| format!("Failed to read '{path}': {e}").into())
    }
}
