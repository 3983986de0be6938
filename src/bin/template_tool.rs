//! Template Tool CLI
//!
//! Validates, hashes and compares template definitions, and runs the
//! flat ↔ hierarchical transform on local JSON files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use report_templates::checksum::Checksum;
use report_templates::schema::bundle_json;
use report_templates::version::parse_version;
use report_templates::{
    Bump, ChangeAnalyzer, FieldLocator, ServiceConfig, TemplateDefinition, Transformer,
};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "template-tool")]
#[command(about = "Validate, hash, compare and apply report templates")]
struct Cli {
    /// Config file (defaults to templates.toml lookup)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a template definition for structural errors
    Validate {
        template: PathBuf,
    },

    /// Print the content hash of one definition, or of a bundle of several
    Hash {
        #[arg(required = true)]
        templates: Vec<PathBuf>,
    },

    /// Structure a flat submission by a template
    Transform {
        #[arg(short, long)]
        template: PathBuf,
        /// Flat field id -> value JSON object
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Flatten hierarchical data back into field id -> value
    Flatten {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare two definitions of the same template
    Compare {
        #[arg(short, long)]
        from: PathBuf,
        #[arg(short, long)]
        to: PathBuf,
        /// Version of the base definition
        #[arg(long, default_value = "1.0.0")]
        base_version: String,
        /// Strict mode - any change is breaking
        #[arg(long)]
        strict: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn read_json(path: &Path) -> Result<Value, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    Ok(serde_json::from_str(&content)?)
}

fn read_object(path: &Path) -> Result<Map<String, Value>, Box<dyn std::error::Error>> {
    match read_json(path)? {
        Value::Object(map) => Ok(map),
        _ => Err(format!("{}: expected a JSON object", path.display()).into()),
    }
}

fn read_definition(path: &Path) -> Result<TemplateDefinition, Box<dyn std::error::Error>> {
    TemplateDefinition::from_json(&read_json(path)?)
        .map_err(|e| format!("{}: {}", path.display(), e).into())
}

fn write_output(value: &Value, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let content = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(path, content)?;
            println!("✅ Written to {}", path.display());
        }
        None => println!("{}", content),
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServiceConfig::load_from(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { template } => {
            let definition = read_definition(&template)?;
            let sections: usize = definition.tabs.iter().map(|t| t.sections.len()).sum();
            println!(
                "✅ {} - {} tabs, {} sections, {} fields",
                template.display(),
                definition.tabs.len(),
                sections,
                definition.field_ids().len()
            );
            Ok(())
        }

        Commands::Hash { templates } => {
            if let [single] = templates.as_slice() {
                println!("{}  {}", read_definition(single)?.checksum()?, single.display());
                return Ok(());
            }

            let mut bundle = BTreeMap::new();
            for path in &templates {
                let definition = read_definition(path)?;
                let key = match &definition.template_id {
                    Some(id) => id.clone(),
                    None => path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .ok_or_else(|| format!("{}: no template id", path.display()))?,
                };
                if bundle.insert(key.clone(), definition).is_some() {
                    return Err(format!("template {} given twice", key).into());
                }
            }
            println!("{}  bundle of {}", Checksum::of_bundle(&bundle_json(&bundle)?), templates.len());
            Ok(())
        }

        Commands::Transform { template, input, output } => {
            let definition = read_definition(&template)?;
            let flat = read_object(&input)?;

            let locator = FieldLocator::build(&definition, &config.transform.common_fields);
            let transformer = Transformer::new(config.transform.to_rules());
            let structured = transformer.forward(&flat, &locator);
            write_output(&Value::Object(structured), output.as_deref())
        }

        Commands::Flatten { input, output } => {
            let hierarchical = read_object(&input)?;
            write_output(&Value::Object(Transformer::reverse(&hierarchical)), output.as_deref())
        }

        Commands::Compare { from, to, base_version, strict, json } => {
            let old = read_definition(&from)?;
            let new = read_definition(&to)?;
            let base = parse_version(&base_version)?;
            let template_id = new
                .template_id
                .clone()
                .or_else(|| old.template_id.clone())
                .unwrap_or_else(|| "template".to_string());

            let analyzer = if strict {
                ChangeAnalyzer::new().strict()
            } else {
                ChangeAnalyzer::new()
            };
            let mut report = analyzer.diff(&template_id, (&base, &old), (&base, &new));
            report.to_version = Bump::for_changes(&report).apply(&base);

            if json {
                write_output(&serde_json::to_value(&report)?, None)?;
            } else {
                println!("🔍 Comparing {} -> {}", from.display(), to.display());
                if strict {
                    println!("  (strict mode enabled)");
                }
                println!();
                for change in &report.changes {
                    let marker = if change.change_type.is_breaking() { "❌" } else { "✅" };
                    println!("{} {}", marker, change.description);
                }
                println!();
                println!("{}", report.summary);
                println!("Suggested version: {} -> {}", report.from_version, report.to_version);
            }

            if report.has_breaking_changes {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
