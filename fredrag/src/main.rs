//! fredrag - ask questions about economic time series
//!
//! Ingests series from the local data directory, analyzes them, and answers
//! questions grounded in the most similar series.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fredrag_core::{
    AnalysisReport, CancellationToken, ChatTurn, Config, Database, ReportKind, ReportPayload,
    Services,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "fredrag")]
#[command(about = "Analyze economic time series and chat about them")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch, store and index one or more series
    Ingest {
        /// Series ids, e.g. GDP UNRATE
        #[arg(required = true)]
        ids: Vec<String>,

        /// Directory holding <ID>.json observation files
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Run an analysis on an ingested series
    Analyze {
        id: String,

        /// trend, volatility, anomaly or summary
        #[arg(short, long, default_value = "summary")]
        kind: ReportKind,

        /// Output format: text (default) or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Find the series most similar to a query
    Search {
        query: String,

        #[arg(short, default_value_t = 5)]
        k: usize,
    },

    /// Ask a question grounded in the indexed series
    Chat {
        message: String,

        #[arg(short, long, default_value = "default")]
        session: String,
    },

    /// Show the turns of a chat session
    History { session: String },

    /// List ingested series
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let mut config = Config::load().context("failed to load configuration")?;
    if let Command::Ingest {
        data_dir: Some(dir), ..
    } = &args.command
    {
        config.ingest.data_dir = Some(dir.clone());
    }

    let _log_guard =
        fredrag_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let db_path = Config::database_path();
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let services =
        Services::with_defaults(config, Arc::new(db)).context("failed to start services")?;
    services.restore().context("failed to restore state")?;

    match args.command {
        Command::Ingest { ids, .. } => ingest(&services, &ids).await,
        Command::Analyze { id, kind, format } => analyze(&services, &id, kind, &format).await,
        Command::Search { query, k } => search(&services, &query, k).await,
        Command::Chat { message, session } => chat(&services, &session, &message).await,
        Command::History { session } => history(&services, &session),
        Command::List => list(&services),
    }
}

async fn ingest(services: &Services, ids: &[String]) -> Result<()> {
    let summary = services.ingest.ingest_all(ids).await;

    for outcome in &summary.ingested {
        let status = match &outcome.index_error {
            None => "indexed".to_string(),
            Some(e) => format!("not indexed: {}", e),
        };
        println!(
            "{}: {} observations ({})",
            outcome.series.id,
            outcome.series.len(),
            status
        );
    }
    for (id, error) in &summary.errors {
        eprintln!("{}: {}", id, error);
    }

    if summary.ingested.is_empty() {
        anyhow::bail!("no series ingested");
    }
    Ok(())
}

async fn analyze(services: &Services, id: &str, kind: ReportKind, format: &str) -> Result<()> {
    let report = services
        .engine
        .analyze(id, kind)
        .await
        .with_context(|| format!("failed to analyze {}", id))?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(report.as_ref())?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &AnalysisReport) {
    println!("{} {} ({})", report.series_id, report.kind, report.id);
    match &report.payload {
        ReportPayload::Trend(t) => {
            println!("  slope:     {:.6}", t.slope);
            println!("  intercept: {:.6}", t.intercept);
            println!("  r^2:       {:.4}", t.r_squared);
            for fit in &t.polynomial {
                println!("  order {:>2}:  {} (r^2 {:.4})", fit.order, fit, fit.r_squared);
            }
            if let Some(log) = &t.logarithmic {
                println!("  log:       {} (r^2 {:.4})", log, log.r_squared);
            }
            if let Some(pct) = &t.percent_change {
                println!("  % change:  {} (r^2 {:.4})", pct, pct.r_squared);
            }
        }
        ReportPayload::Volatility(v) => {
            println!("  mean:    {:.4}", v.mean);
            println!("  std dev: {:.4}", v.std_dev);
            println!("  range:   {:.4} .. {:.4}", v.min, v.max);
            if let Some(pct) = v.mean_pct_change {
                println!("  mean % change: {:.4}", pct);
            }
        }
        ReportPayload::Anomaly(a) => {
            println!("  threshold: {:.2}", a.threshold);
            println!("  flagged:   {} of {}", a.flagged.len(), a.z_scores.len());
            for &i in &a.flagged {
                println!("    #{} z={:.3}", i, a.z_scores[i]);
            }
        }
        ReportPayload::Summary(s) => println!("  {}", s.text),
    }
}

async fn search(services: &Services, query: &str, k: usize) -> Result<()> {
    let hits = services.search(query, k).await.context("search failed")?;
    for hit in hits {
        println!("{:.4}  {}", hit.similarity, hit.entry.series_id);
    }
    Ok(())
}

async fn chat(services: &Services, session: &str, message: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let result = services.chat.submit_turn(session, message, &cancel).await;
    interrupt.abort();

    let turn = result.context("chat turn failed")?;
    print_turn(&turn);
    Ok(())
}

fn print_turn(turn: &ChatTurn) {
    println!("{}", turn.response);
    if !turn.context.is_empty() {
        println!("  sources: {}", turn.context_series_ids().join(", "));
    }
    if let Some(kind) = turn.failure {
        println!("  (fallback: {})", kind.as_str());
    }
}

fn history(services: &Services, session: &str) -> Result<()> {
    let session = services
        .chat
        .session(session)
        .with_context(|| format!("no session '{}'", session))?;

    for turn in &session.turns {
        println!("[{}] > {}", turn.timestamp.to_rfc3339(), turn.user_input);
        print_turn(turn);
        println!();
    }
    Ok(())
}

fn list(services: &Services) -> Result<()> {
    let ids = services.store.list();
    if ids.is_empty() {
        println!("No series ingested.");
        println!("Run 'fredrag ingest <ID>...' first.");
        return Ok(());
    }

    for id in ids {
        let series = services.store.get(&id)?;
        let indexed = if services.index.get(&id).is_some() {
            "indexed"
        } else {
            "not indexed"
        };
        println!("{}: {} observations ({})", id, series.len(), indexed);
    }
    Ok(())
}
