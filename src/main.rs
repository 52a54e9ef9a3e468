use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use alertdesk::config::{AppConfig, LoggingConfig};
use alertdesk::ruletest::{
    OutputFormat, RuleTester, TestError, TestOptions, TestOptionsRequest, TestOutcome, TestType,
};

#[derive(Parser)]
#[command(
    name = "alertdesk",
    about = "Management backend for authoring, testing, and silencing ElastAlert rules",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP / WebSocket server
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Test a rule file against the ElastAlert engine
    TestRule {
        /// Rule file to test
        rule_file: PathBuf,

        /// Number of days of data to query
        #[arg(long, conflicts_with_all = ["start", "end"])]
        days: Option<u32>,

        /// Start of the query window
        #[arg(long, requires = "end")]
        start: Option<String>,

        /// End of the query window
        #[arg(long, requires = "start")]
        end: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "plain")]
        format: FormatArg,

        /// Maximum number of documents to fetch (0 = engine default)
        #[arg(long, default_value = "0")]
        max_results: u64,

        /// Send alerts instead of only reporting matches
        #[arg(long)]
        alert: bool,

        /// What to check
        #[arg(long, value_enum, default_value = "all")]
        test_type: TestTypeArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Plain,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Plain => OutputFormat::Plain,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TestTypeArg {
    All,
    SchemaOnly,
    CountOnly,
}

impl From<TestTypeArg> for TestType {
    fn from(arg: TestTypeArg) -> Self {
        match arg {
            TestTypeArg::All => TestType::All,
            TestTypeArg::SchemaOnly => TestType::SchemaOnly,
            TestTypeArg::CountOnly => TestType::CountOnly,
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    // stdout carries test output; logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting alertdesk server");
            alertdesk::serve(config).await?;
        }
        Commands::TestRule {
            rule_file,
            days,
            start,
            end,
            format,
            max_results,
            alert,
            test_type,
        } => {
            let rule = std::fs::read_to_string(&rule_file)
                .with_context(|| format!("failed to read rule file: {}", rule_file.display()))?;
            let options = TestOptions::try_from(TestOptionsRequest {
                start,
                end,
                days,
                format: format.into(),
                max_results,
                alert,
                test_type: test_type.into(),
            })?;

            tracing::info!(rule = %rule_file.display(), "Testing rule");
            let tester = RuleTester::from_config(&config).await;
            match tester.test_rule(&rule, &options, None).await {
                Ok(TestOutcome::Succeeded(output)) => print!("{output}"),
                Ok(TestOutcome::Cancelled { exit_code }) => {
                    eprintln!("rule test ended with exit code {exit_code:?}");
                    std::process::exit(1);
                }
                Err(TestError::RuntimeFailure { stderr, .. }) => {
                    eprintln!("{stderr}");
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}
