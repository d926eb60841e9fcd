use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fhir::OutputFormat;
use h2f_core::{resolve_template_dir, Converter, ConverterConfig, IdStrategy};

#[derive(Parser)]
#[command(name = "h2f")]
#[command(about = "Template-driven HL7 v2 to FHIR converter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert one HL7 v2 message file into a FHIR bundle on stdout
    Convert {
        /// Message file (`-` reads stdin)
        file: PathBuf,
        /// Template directory (default: H2F_TEMPLATE_DIR, then the bundled templates)
        #[arg(long)]
        templates: Option<PathBuf>,
        /// Output format: json or yaml
        #[arg(long, default_value = "json")]
        format: OutputFormat,
        /// Number resources `<type>-<n>` instead of using random UUIDs
        #[arg(long)]
        sequential_ids: bool,
    },
    /// Load and validate a template directory
    CheckTemplates {
        /// Template directory (default: H2F_TEMPLATE_DIR, then the bundled templates)
        #[arg(long)]
        templates: Option<PathBuf>,
    },
    /// Print the group tree a message parses into
    Structure {
        /// Message file (`-` reads stdin)
        file: PathBuf,
        /// Template directory whose `structure.yml` extends the bundled structures
        #[arg(long)]
        templates: Option<PathBuf>,
    },
}

/// Main entry point for the `h2f` converter.
///
/// # Environment Variables
/// - `H2F_TEMPLATE_DIR`: template directory used when `--templates` is not given
/// - `H2F_ID_STRATEGY`: `uuid` (default) or `sequential`; `--sequential-ids` overrides it
/// - `RUST_LOG`: log filter (default: `h2f=info`), logs go to stderr
fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("h2f=info".parse()?)
                .add_directive("hl7v2_fhir=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            file,
            templates,
            format,
            sequential_ids,
        } => {
            let id_strategy = if sequential_ids {
                IdStrategy::Sequential
            } else {
                env_id_strategy()?
            };
            let converter = load_converter(templates, id_strategy)?;
            let text = read_message(&file)?;
            let bundle = converter
                .convert(&text)
                .with_context(|| format!("failed to convert {}", file.display()))?;
            println!("{}", bundle.render(format)?);
        }
        Commands::CheckTemplates { templates } => {
            let converter = load_converter(templates, IdStrategy::default())?;
            let mut structures: Vec<&str> = converter.templates().message_structures().collect();
            structures.sort_unstable();
            println!(
                "{}: {} templates, {} message structures",
                converter.config().template_dir().display(),
                converter.templates().definition_count(),
                structures.len()
            );
            for structure in structures {
                println!("  {structure}");
            }
        }
        Commands::Structure { file, templates } => {
            let converter = load_converter(templates, IdStrategy::default())?;
            let text = read_message(&file)?;
            let message = converter.parse(&text)?;
            println!("{}", message.structure());
            print!("{}", message.outline());
        }
    }

    Ok(())
}

fn env_id_strategy() -> anyhow::Result<IdStrategy> {
    match std::env::var("H2F_ID_STRATEGY") {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(IdStrategy::default()),
    }
}

fn load_converter(templates: Option<PathBuf>, id_strategy: IdStrategy) -> anyhow::Result<Converter> {
    let override_dir = templates.or_else(|| std::env::var_os("H2F_TEMPLATE_DIR").map(PathBuf::from));
    let template_dir = resolve_template_dir(override_dir)?;
    tracing::debug!(dir = %template_dir.display(), ?id_strategy, "loading templates");

    let config = ConverterConfig::new(template_dir, id_strategy)?;
    Converter::new(config).context("failed to load templates")
}

fn read_message(file: &Path) -> anyhow::Result<String> {
    if file == Path::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("failed to read stdin");
    }
    std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))
}
