//! BiasService facade.
//!
//! Wires storage, the change detector, the scheduler and the scorer together
//! and exposes the operations an API layer needs: start/stop, bias queries,
//! manual updates, calendar events and status.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use zero_common::Error;

use crate::data::{AssetConfig, DataSource};
use crate::detection::{ChangeDetectionEngine, ChangeDetectionResult};
use crate::scheduler::{ScheduledEvent, SchedulerStatus, UpdateScheduler};
use crate::scoring::{default_factors, BiasScoringEngine, ScoringResult};
use crate::settings::FundamentalsSettings;
use crate::storage::Storage;
use crate::types::BiasScore;

// ============================================================================
// Views
// ============================================================================

/// An asset with its latest bias, if one has been computed.
#[derive(Debug, Clone, Serialize)]
pub struct AssetOverview {
    pub asset: AssetConfig,
    pub bias_score: Option<BiasScore>,
}

/// Service health summary.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub is_running: bool,
    pub assets_tracked: usize,
    pub assets_with_scores: usize,
    /// Mean confidence over assets with scores; 0 when there are none
    pub average_confidence: f64,
    pub system_load: f64,
    pub scheduler: SchedulerStatus,
}

// ============================================================================
// BiasService
// ============================================================================

/// Orchestration facade over the fundamentals pipeline.
pub struct BiasService {
    settings: FundamentalsSettings,
    storage: Arc<dyn Storage>,
    scoring: Arc<BiasScoringEngine>,
    scheduler: Arc<UpdateScheduler>,
    running: AtomicBool,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl BiasService {
    /// Build the pipeline and register one job per configured source.
    pub fn new(
        settings: FundamentalsSettings,
        storage: Arc<dyn Storage>,
        data_source: Arc<dyn DataSource>,
    ) -> Self {
        let engine = Arc::new(ChangeDetectionEngine::new(
            Arc::clone(&storage),
            data_source,
            settings.fetch_timeout,
        ));
        let scheduler = Arc::new(UpdateScheduler::new(settings.scheduler.clone(), engine));
        let scoring = Arc::new(BiasScoringEngine::new(
            Arc::clone(&storage),
            default_factors(),
            settings.snapshot_limit,
        ));

        let now = Utc::now();
        for source in &settings.sources {
            scheduler.register_source(source.clone(), now);
        }

        Self {
            settings,
            storage,
            scoring,
            scheduler,
            running: AtomicBool::new(false),
            loop_task: Mutex::new(None),
            listener_task: Mutex::new(None),
        }
    }

    pub fn scheduler(&self) -> &Arc<UpdateScheduler> {
        &self.scheduler
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn tracked_asset(&self, symbol: &str) -> Option<&AssetConfig> {
        self.settings.assets.iter().find(|a| a.symbol == symbol)
    }

    /// Compute initial scores, then start the scheduler loop and the
    /// results listener.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Bias service already running");
            return Ok(());
        }

        info!(
            assets = self.settings.assets.len(),
            sources = self.settings.sources.len(),
            storage = %self.storage.name(),
            "Starting bias service"
        );

        for asset in &self.settings.assets {
            if let Err(e) = self.refresh_asset_score(&asset.symbol).await {
                error!(asset = %asset.symbol, error = %e, "Initial bias calculation failed");
            }
        }

        self.scheduler.prepare_run().await;
        *self.loop_task.lock().await = Some(tokio::spawn(Arc::clone(&self.scheduler).run()));

        // the listener outlives stop/start cycles
        if let Some(results) = self.scheduler.take_results() {
            *self.listener_task.lock().await = Some(tokio::spawn(listen_for_changes(
                results,
                Arc::clone(&self.scoring),
            )));
        }

        Ok(())
    }

    /// Stop the scheduler loop. In-flight updates finish on their own.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.scheduler.stop().await;

        if let Some(handle) = self.loop_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler task ended abnormally");
            }
        }
        info!("Bias service stopped");
    }

    /// Latest bias of every tracked asset, in configuration order.
    pub async fn get_all_bias_scores(&self) -> Result<Vec<AssetOverview>> {
        let mut latest = self
            .storage
            .get_all_latest_bias_scores()
            .await
            .context("Failed to load bias scores")?;

        Ok(self
            .settings
            .assets
            .iter()
            .map(|asset| {
                let position = latest.iter().position(|s| s.asset == asset.symbol);
                AssetOverview {
                    asset: asset.clone(),
                    bias_score: position.map(|i| latest.swap_remove(i)),
                }
            })
            .collect())
    }

    /// Latest bias of one asset; `None` for assets that are not tracked.
    pub async fn get_asset_bias_score(&self, symbol: &str) -> Result<Option<AssetOverview>> {
        let Some(asset) = self.tracked_asset(symbol) else {
            return Ok(None);
        };
        let bias_score = self
            .storage
            .get_latest_bias_score(symbol)
            .await
            .with_context(|| format!("Failed to load bias score for {symbol}"))?;
        Ok(Some(AssetOverview {
            asset: asset.clone(),
            bias_score,
        }))
    }

    pub async fn get_bias_history(&self, symbol: &str, limit: usize) -> Result<Vec<BiasScore>> {
        self.storage
            .get_bias_history(symbol, limit)
            .await
            .with_context(|| format!("Failed to load bias history for {symbol}"))
    }

    /// Check every source of an asset now and rescore it if anything changed.
    ///
    /// Sources that are busy or rate limited are left out of the result.
    pub async fn trigger_asset_update(
        &self,
        symbol: &str,
        reason: &str,
    ) -> Result<Vec<ChangeDetectionResult>> {
        if self.tracked_asset(symbol).is_none() {
            return Err(Error::NotFound(format!("asset {symbol}")).into());
        }

        let now = Utc::now();
        let mut updates = JoinSet::new();
        for source in self.settings.sources_for(symbol) {
            let scheduler = Arc::clone(&self.scheduler);
            let asset = source.asset.clone();
            let data_type = source.data_type;
            let reason = reason.to_string();
            updates.spawn(async move {
                scheduler
                    .trigger_immediate_update(&asset, data_type, &reason, now)
                    .await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = updates.join_next().await {
            let outcome = joined.context("Update task panicked")?;
            if let Some(result) = outcome.with_context(|| format!("Update failed for {symbol}"))? {
                results.push(result);
            }
        }
        results.sort_by_key(|r| r.data_type);

        if results.iter().any(|r| r.has_changes) {
            self.refresh_asset_score(symbol).await?;
        }

        info!(
            asset = %symbol,
            reason = %reason,
            checked = results.len(),
            changed = results.iter().filter(|r| r.has_changes).count(),
            "Asset update complete"
        );
        Ok(results)
    }

    /// Add a calendar event for a tracked asset.
    pub fn add_scheduled_event(&self, event: ScheduledEvent) -> Result<()> {
        if self.tracked_asset(&event.asset).is_none() {
            return Err(Error::NotFound(format!("asset {}", event.asset)).into());
        }
        self.scheduler.add_event(event);
        Ok(())
    }

    pub async fn get_service_status(&self) -> Result<ServiceStatus> {
        let scores = self
            .storage
            .get_all_latest_bias_scores()
            .await
            .context("Failed to load bias scores")?;
        let scheduler = self.scheduler.status().await;

        let average_confidence = if scores.is_empty() {
            0.0
        } else {
            scores.iter().map(|s| s.confidence).sum::<f64>() / scores.len() as f64
        };

        Ok(ServiceStatus {
            is_running: self.is_running(),
            assets_tracked: self.settings.assets.len(),
            assets_with_scores: scores.len(),
            average_confidence,
            system_load: scheduler.system_load,
            scheduler,
        })
    }

    /// Recompute and store the bias of one asset.
    pub async fn refresh_asset_score(&self, symbol: &str) -> Result<ScoringResult> {
        self.refresh_asset_score_at(symbol, Utc::now()).await
    }

    pub async fn refresh_asset_score_at(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<ScoringResult> {
        self.scoring
            .calculate_bias_score(symbol, now)
            .await
            .with_context(|| format!("Failed to score {symbol}"))
    }
}

impl Drop for BiasService {
    fn drop(&mut self) {
        for task in [self.loop_task.get_mut(), self.listener_task.get_mut()] {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

/// Rescore assets whose data changed, as results arrive from the scheduler.
async fn listen_for_changes(
    mut results: mpsc::Receiver<ChangeDetectionResult>,
    scoring: Arc<BiasScoringEngine>,
) {
    while let Some(result) = results.recv().await {
        if !result.has_changes {
            continue;
        }
        debug!(asset = %result.asset, data_type = %result.data_type, "Change received, rescoring");
        if let Err(e) = scoring.calculate_bias_score(&result.asset, Utc::now()).await {
            error!(asset = %result.asset, error = %e, "Bias recalculation failed");
        }
    }
    debug!("Results channel closed, listener exiting");
}
