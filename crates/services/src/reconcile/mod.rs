//! 信号对账：匹配器、实时入库、回填

pub mod backfill;
pub mod ingest;
pub mod matcher;
pub mod retry;

pub use backfill::{BackfillDriver, BackfillOptions, BackfillReport, BackfillSide, PatternBreakdown};
pub use ingest::{InboundAlert, IngestError, IngestOutcome, IngestedSignal, SignalIngestService};
pub use matcher::{MatchPlan, MatchResult, MatchedTrade, SignalMatcher};
pub use retry::RetryPolicy;
