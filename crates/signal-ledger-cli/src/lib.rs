//! # Signal Ledger CLI
//!
//! 信号账本运维入口
//!
//! - `migrate` — 创建 signal_records 表
//! - `ingest` — 从 JSONL 文件回放告警，逐条走实时入库流程
//! - `backfill` — 批量回填未匹配记录，输出汇总报告
//! - `summary` — 已平仓交易汇总

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use signal_ledger_core::config::ReconcileConfig;
use signal_ledger_core::database::{close_db_pool, get_db_pool, health_check, init_db_pool};
use signal_ledger_core::logger::setup_logging;
use signal_ledger_domain::traits::SignalRepository;
use signal_ledger_infrastructure::SqlxSignalRepository;
use signal_ledger_services::reconcile::{
    BackfillDriver, BackfillOptions, BackfillReport, BackfillSide, InboundAlert, IngestOutcome,
    MatchResult, SignalIngestService, SignalMatcher,
};

/// 实盘回填前的等待时间
const LIVE_MODE_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "signal-ledger", about = "Signal ledger reconciliation tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SideArg {
    /// Walk open entries and look ahead for their exits.
    Entries,
    /// Walk unconsumed exits and match each to the oldest open entry.
    Exits,
}

impl From<SideArg> for BackfillSide {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Entries => BackfillSide::OpenEntries,
            SideArg::Exits => BackfillSide::UnconsumedExits,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the signal_records table if it does not exist.
    Migrate,
    /// Replay inbound alerts from a JSONL file through live ingestion.
    Ingest {
        /// One alert per line: rawText, type, symbol, direction, price, strategy, receivedAt.
        #[arg(long)]
        file: PathBuf,
    },
    /// Match historical unmatched records in bulk.
    Backfill {
        #[arg(long, value_enum, default_value_t = SideArg::Entries)]
        side: SideArg,

        /// Compute and report matches without touching the ledger.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Maximum number of records to scan.
        #[arg(long)]
        limit: Option<usize>,

        /// Records per page. Defaults to RECONCILE_BATCH_SIZE.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Lookahead window for the entries side. Defaults to RECONCILE_LOOKAHEAD.
        #[arg(long)]
        lookahead: Option<usize>,

        /// Skip the live-mode grace period.
        #[arg(long, short = 'y', default_value_t = false)]
        yes: bool,

        /// Print the report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Closed-trade summary.
    Summary {
        /// Exact strategy key.
        #[arg(long)]
        strategy: Option<String>,
    },
}

/// 应用初始化
pub async fn app_init() -> Result<()> {
    // 加载环境变量
    dotenv().ok();

    // 设置日志
    setup_logging().await?;

    // 初始化数据库连接
    init_db_pool().await?;

    info!("应用初始化完成");
    Ok(())
}

/// 执行命令
pub async fn run(cli: Cli) -> Result<()> {
    let config = ReconcileConfig::from_env();
    let repository = Arc::new(SqlxSignalRepository::new(get_db_pool()?.clone()));

    let result = match cli.command {
        Commands::Migrate => match health_check().await {
            Ok(()) => repository.ensure_schema().await.map_err(anyhow::Error::from),
            Err(e) => Err(e),
        },
        Commands::Ingest { file } => {
            let matcher = Arc::new(SignalMatcher::new(repository, &config));
            replay_alerts(&SignalIngestService::new(matcher, &config), &file).await
        }
        Commands::Backfill {
            side,
            dry_run,
            limit,
            batch_size,
            lookahead,
            yes,
            json,
        } => {
            let mut options = BackfillOptions::from_config(&config, side.into())
                .dry_run(dry_run)
                .limit(limit);
            if let Some(batch_size) = batch_size.filter(|n| *n > 0) {
                options.batch_size = batch_size;
            }
            if let Some(lookahead) = lookahead.filter(|n| *n > 0) {
                options.lookahead = lookahead;
            }

            if !dry_run && !yes {
                warn!(
                    "⚠️ 实盘模式将修改账本，{} 秒后开始，Ctrl+C 取消",
                    LIVE_MODE_GRACE.as_secs()
                );
                tokio::time::sleep(LIVE_MODE_GRACE).await;
            }

            let matcher = Arc::new(SignalMatcher::new(repository, &config));
            let report = BackfillDriver::new(matcher).run(&options).await;
            print_report(&report, json)
        }
        Commands::Summary { strategy } => {
            let summary = repository.summarize_closed(strategy.as_deref()).await?;
            println!("closed trades : {}", summary.closed);
            println!("wins / losses : {} / {}", summary.wins, summary.losses);
            println!("needs review  : {}", summary.flagged);
            println!("win rate      : {:.2}%", summary.win_rate() * 100.0);
            println!("total pnl     : {:.4}%", summary.total_pnl);
            println!("average pnl   : {:.4}%", summary.average_pnl());
            Ok(())
        }
    };

    close_db_pool().await?;
    result
}

async fn replay_alerts(service: &SignalIngestService, file: &PathBuf) -> Result<()> {
    let handle = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("无法打开文件: {}", file.display()))?;
    let mut lines = BufReader::new(handle).lines();

    let (mut recorded, mut duplicates, mut matched, mut rejected) = (0u64, 0u64, 0u64, 0u64);
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let alert: InboundAlert = match serde_json::from_str(&line) {
            Ok(alert) => alert,
            Err(e) => {
                warn!("第 {} 行无法解析，跳过: {}", line_no, e);
                rejected += 1;
                continue;
            }
        };

        match service.ingest(alert).await {
            Ok(IngestOutcome::Duplicate { .. }) => duplicates += 1,
            Ok(IngestOutcome::Recorded(signal)) => {
                recorded += 1;
                if matches!(signal.match_result, Some(MatchResult::Matched(_))) {
                    matched += 1;
                }
            }
            Err(e) => {
                // 单条失败不影响后续告警
                warn!("第 {} 行入库失败: {}", line_no, e);
                rejected += 1;
            }
        }
    }

    info!(
        "回放完成: recorded={} matched={} duplicates={} rejected={}",
        recorded, matched, duplicates, rejected
    );
    println!(
        "recorded={} matched={} duplicates={} rejected={}",
        recorded, matched, duplicates, rejected
    );
    Ok(())
}

fn print_report(report: &BackfillReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let mode = if report.dry_run { "DRY RUN" } else { "LIVE" };
    println!("backfill {} [{}] run_id={}", report.side.as_str(), mode, report.run_id);
    println!("scanned    : {}", report.scanned);
    println!("matched    : {}", report.matched);
    println!("orphaned   : {}", report.orphaned);
    println!("conflicts  : {}", report.conflicts);
    println!("errors     : {}", report.errors);
    println!("skipped    : {}", report.skipped);
    println!(
        "wins/losses: {} / {} (win rate {:.2}%)",
        report.profitable,
        report.losing,
        report.win_rate() * 100.0
    );
    println!("review     : {}", report.flagged);
    println!(
        "total pnl  : {:.4}% (avg {:.4}%)",
        report.total_pnl,
        report.average_pnl()
    );
    println!(
        "patterns   : explicit={} flat={} close={} reversal={}",
        report.patterns.explicit_exit,
        report.patterns.flat_position,
        report.patterns.close_action,
        report.patterns.reversal
    );
    if report.companions_created > 0 {
        println!("companions : {}", report.companions_created);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backfill_args() {
        let cli = Cli::try_parse_from([
            "signal-ledger",
            "backfill",
            "--side",
            "exits",
            "--dry-run",
            "--limit",
            "500",
        ])
        .unwrap();

        match cli.command {
            Commands::Backfill {
                side,
                dry_run,
                limit,
                batch_size,
                yes,
                ..
            } => {
                assert_eq!(BackfillSide::from(side), BackfillSide::UnconsumedExits);
                assert!(dry_run);
                assert_eq!(limit, Some(500));
                assert_eq!(batch_size, None);
                assert!(!yes);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_default_side_is_entries() {
        let cli = Cli::try_parse_from(["signal-ledger", "backfill", "-y"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Backfill {
                side: SideArg::Entries,
                yes: true,
                ..
            }
        ));
    }

    #[test]
    fn test_ingest_requires_file() {
        assert!(Cli::try_parse_from(["signal-ledger", "ingest"]).is_err());
    }
}
