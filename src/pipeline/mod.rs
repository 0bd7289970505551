//! Ingestion orchestrator: one run = fetch → filter → per-record
//! normalize/resolve/write.
//!
//! Per-record processing is isolated: a resolution or write failure is
//! logged with the record's identity context, counted, and the loop moves
//! on. Only two things end a run early — the feed fetch itself failing, and
//! storage being unreachable before any record work starts.

use crate::feed::PriceFeed;
use crate::feed::cleaner::{filter_state, record_to_observation};
use crate::models::FeedRecord;
use crate::storage::MarketStore;
use crate::utils::Timer;
use anyhow::{Context, Result};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

// ── Per-record failures ───────────────────────────────────────────────────────

/// Why one record was skipped. Never aborts the run.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record is missing its {0} field")]
    MissingField(&'static str),

    #[error("could not resolve market {state}/{district}/{market}: {source}")]
    Resolve {
        state: String,
        district: String,
        market: String,
        source: anyhow::Error,
    },

    #[error("could not write observation of {commodity:?} for market {market_id}: {source}")]
    Write {
        commodity: String,
        market_id: i64,
        source: anyhow::Error,
    },
}

impl RecordError {
    fn resolve(state: &str, district: &str, market: &str, source: anyhow::Error) -> Self {
        Self::Resolve {
            state: state.to_string(),
            district: district.to_string(),
            market: market.to_string(),
            source,
        }
    }
}

// ── Run summary ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct Pipeline {
    feed: Box<dyn PriceFeed>,
    store: Arc<dyn MarketStore>,
    target_state: String,
}

impl Pipeline {
    pub fn new(feed: Box<dyn PriceFeed>, store: Arc<dyn MarketStore>, target_state: String) -> Self {
        Self {
            feed,
            store,
            target_state,
        }
    }

    /// One complete ingestion pass. Returns `Err` only for terminal
    /// conditions (unreachable storage, failed fetch); partial per-record
    /// failures are reported through the summary.
    pub async fn run(&self) -> Result<RunSummary> {
        let _t = Timer::start("ingestion run");

        self.store.ping().context("storage unavailable")?;

        let run_id = self.store.begin_run().unwrap_or_else(|e| {
            warn!("Could not open run log row: {:#}", e);
            0
        });

        let records = match self.feed.fetch_records().await {
            Ok(records) => records,
            Err(e) => {
                self.store
                    .finish_run(run_id, 0, 0, 0, Some(&e.to_string()))
                    .ok();
                return Err(anyhow::Error::new(e).context("feed fetch failed"));
            }
        };

        let records = filter_state(records, &self.target_state);
        info!(
            "{} records for state {:?} after filtering",
            records.len(),
            self.target_state
        );

        let mut summary = RunSummary {
            attempted: records.len(),
            ..Default::default()
        };

        for rec in &records {
            match self.process_record(rec) {
                Ok(obs_id) => {
                    summary.succeeded += 1;
                    debug!(
                        "Stored observation {} ({:?} @ {:?})",
                        obs_id, rec.commodity, rec.market
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        "Record skipped (market {:?}, commodity {:?}, raw date {:?}): {}",
                        rec.market, rec.commodity, rec.arrival_date, e
                    );
                }
            }
        }

        let error_note = if summary.failed > 0 {
            Some(format!("{} records failed", summary.failed))
        } else {
            None
        };
        self.store
            .finish_run(
                run_id,
                summary.attempted,
                summary.succeeded,
                summary.failed,
                error_note.as_deref(),
            )
            .ok();

        info!(
            "Run finished: {} attempted | {} succeeded | {} failed",
            summary.attempted, summary.succeeded, summary.failed
        );
        Ok(summary)
    }

    fn process_record(&self, rec: &FeedRecord) -> Result<i64, RecordError> {
        let state = non_empty(&rec.state).ok_or(RecordError::MissingField("state"))?;
        let district = non_empty(&rec.district).ok_or(RecordError::MissingField("district"))?;
        let market = non_empty(&rec.market).ok_or(RecordError::MissingField("market"))?;

        let market_id = self.resolve_market(state, district, market)?;

        let obs = record_to_observation(rec);
        self.store
            .insert_observation(market_id, &obs)
            .map_err(|source| RecordError::Write {
                commodity: obs.commodity.clone(),
                market_id,
                source,
            })
    }

    /// Insert-if-absent resolution of the identity triple to a market id.
    ///
    /// The scheduler guarantees one run at a time, so check-then-insert is
    /// ordinarily race-free; the unique constraint plus the conflict
    /// re-query below is the backstop should two resolvers ever overlap.
    fn resolve_market(
        &self,
        state: &str,
        district: &str,
        market: &str,
    ) -> Result<i64, RecordError> {
        if let Some(id) = self
            .store
            .find_market(state, district, market)
            .map_err(|e| RecordError::resolve(state, district, market, e))?
        {
            // Best effort: the id is already known, so a failed last-seen
            // refresh must not fail the record.
            if let Err(e) = self.store.touch_market(id) {
                warn!(
                    "last_seen refresh failed for market {} ({}/{}/{}): {:#}",
                    id, state, district, market, e
                );
            }
            return Ok(id);
        }

        if let Some(id) = self
            .store
            .insert_market(state, district, market)
            .map_err(|e| RecordError::resolve(state, district, market, e))?
        {
            debug!("New market {}: {}/{}/{}", id, state, district, market);
            return Ok(id);
        }

        // Lost an insert race; the row exists now, re-read its id.
        self.store
            .find_market(state, district, market)
            .map_err(|e| RecordError::resolve(state, district, market, e))?
            .ok_or_else(|| {
                RecordError::resolve(
                    state,
                    district,
                    market,
                    anyhow::anyhow!("market missing after insert conflict"),
                )
            })
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedError;
    use crate::models::NewObservation;
    use crate::storage::Repository;
    use async_trait::async_trait;

    const STATE: &str = "Tamil Nadu";

    fn rec(market: &str, commodity: &str) -> FeedRecord {
        FeedRecord {
            state: Some(STATE.to_string()),
            district: Some("Coimbatore".to_string()),
            market: Some(market.to_string()),
            commodity: Some(commodity.to_string()),
            variety: Some("Local".to_string()),
            min_price: Some("1000".to_string()),
            modal_price: Some("1250".to_string()),
            max_price: Some("1400".to_string()),
            arrivals_in_tonnes: Some("2.5".to_string()),
            arrival_date: Some("05/03/2024".to_string()),
        }
    }

    struct StaticFeed {
        records: Vec<FeedRecord>,
    }

    #[async_trait]
    impl PriceFeed for StaticFeed {
        async fn fetch_records(&self) -> Result<Vec<FeedRecord>, FeedError> {
            Ok(self.records.clone())
        }
    }

    struct BrokenFeed;

    #[async_trait]
    impl PriceFeed for BrokenFeed {
        async fn fetch_records(&self) -> Result<Vec<FeedRecord>, FeedError> {
            Err(FeedError::Envelope("missing records array".to_string()))
        }
    }

    /// Delegates to a real repository but fails market lookups for one
    /// market name, simulating a storage error at the resolve step.
    struct FlakyStore {
        inner: Arc<Repository>,
        fail_market: &'static str,
    }

    impl MarketStore for FlakyStore {
        fn ping(&self) -> Result<()> {
            self.inner.ping()
        }
        fn find_market(&self, state: &str, district: &str, market: &str) -> Result<Option<i64>> {
            if market == self.fail_market {
                anyhow::bail!("simulated storage error");
            }
            self.inner.find_market(state, district, market)
        }
        fn insert_market(&self, state: &str, district: &str, market: &str) -> Result<Option<i64>> {
            self.inner.insert_market(state, district, market)
        }
        fn touch_market(&self, id: i64) -> Result<()> {
            self.inner.touch_market(id)
        }
        fn insert_observation(&self, market_id: i64, obs: &NewObservation) -> Result<i64> {
            self.inner.insert_observation(market_id, obs)
        }
        fn begin_run(&self) -> Result<i64> {
            self.inner.begin_run()
        }
        fn finish_run(
            &self,
            run_id: i64,
            attempted: usize,
            succeeded: usize,
            failed: usize,
            error: Option<&str>,
        ) -> Result<()> {
            self.inner.finish_run(run_id, attempted, succeeded, failed, error)
        }
    }

    fn repo() -> Arc<Repository> {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        Arc::new(repo)
    }

    fn pipeline(records: Vec<FeedRecord>, repo: Arc<Repository>) -> Pipeline {
        Pipeline::new(
            Box::new(StaticFeed { records }),
            repo,
            STATE.to_string(),
        )
    }

    #[tokio::test]
    async fn test_healthy_batch_is_fully_ingested() {
        let repo = repo();
        let records = vec![
            rec("Karamadai", "Tomato"),
            rec("Karamadai", "Onion"),
            rec("Oddanchatram", "Tomato"),
        ];

        let summary = pipeline(records, Arc::clone(&repo)).run().await.unwrap();

        assert_eq!(
            summary,
            RunSummary {
                attempted: 3,
                succeeded: 3,
                failed: 0
            }
        );
        // Two distinct markets, one per triple.
        assert_eq!(repo.market_count().unwrap(), 2);
        assert_eq!(repo.observation_count().unwrap(), 3);
        assert_eq!(repo.last_run().unwrap().unwrap().status, "success");
    }

    #[tokio::test]
    async fn test_one_bad_record_does_not_poison_the_batch() {
        let repo = repo();
        let mut records: Vec<FeedRecord> = (0..9)
            .map(|i| rec(&format!("Market{i}"), "Tomato"))
            .collect();
        records.insert(4, rec("Broken", "Tomato"));

        let store = Arc::new(FlakyStore {
            inner: Arc::clone(&repo),
            fail_market: "Broken",
        });
        let feed = Box::new(StaticFeed { records });
        let summary = Pipeline::new(feed, store, STATE.to_string())
            .run()
            .await
            .unwrap();

        assert_eq!(
            summary,
            RunSummary {
                attempted: 10,
                succeeded: 9,
                failed: 1
            }
        );
        assert_eq!(repo.observation_count().unwrap(), 9);
        let run = repo.last_run().unwrap().unwrap();
        assert_eq!(run.status, "error");
        assert_eq!(run.failed, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_terminal_and_writes_nothing() {
        let repo = repo();
        let p = Pipeline::new(Box::new(BrokenFeed), repo.clone() as Arc<dyn MarketStore>, STATE.to_string());

        let err = p.run().await.unwrap_err();
        assert!(err.to_string().contains("feed fetch failed"));

        assert_eq!(repo.market_count().unwrap(), 0);
        assert_eq!(repo.observation_count().unwrap(), 0);
        let run = repo.last_run().unwrap().unwrap();
        assert_eq!(run.status, "error");
        assert_eq!(run.attempted, 0);
    }

    #[tokio::test]
    async fn test_repeat_runs_reuse_the_market_row() {
        let repo = repo();

        pipeline(vec![rec("Karamadai", "Tomato")], Arc::clone(&repo))
            .run()
            .await
            .unwrap();
        pipeline(vec![rec("Karamadai", "Onion")], Arc::clone(&repo))
            .run()
            .await
            .unwrap();

        assert_eq!(repo.market_count().unwrap(), 1);
        assert_eq!(repo.observation_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_other_states_are_filtered_out() {
        let repo = repo();
        let mut foreign = rec("Palakkad", "Coconut");
        foreign.state = Some("Kerala".to_string());

        let summary = pipeline(
            vec![foreign, rec("Karamadai", "Tomato")],
            Arc::clone(&repo),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(summary.attempted, 1);
        assert_eq!(repo.observation_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_without_market_name_is_counted_failed() {
        let repo = repo();
        let mut nameless = rec("", "Tomato");
        nameless.market = None;

        let summary = pipeline(
            vec![nameless, rec("Karamadai", "Tomato")],
            Arc::clone(&repo),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(
            summary,
            RunSummary {
                attempted: 2,
                succeeded: 1,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_unparseable_date_still_ingests() {
        let repo = repo();
        let mut smudged = rec("Karamadai", "Tomato");
        smudged.arrival_date = Some("last tuesday".to_string());

        let summary = pipeline(vec![smudged], Arc::clone(&repo)).run().await.unwrap();
        assert_eq!(summary.succeeded, 1);

        let market_id = repo
            .find_market(STATE, "Coimbatore", "Karamadai")
            .unwrap()
            .unwrap();
        let latest = repo.latest_prices(market_id).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].observed_on, None);
    }
}
