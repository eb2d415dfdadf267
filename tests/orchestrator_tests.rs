//! End-to-end cycles over the scripted browser and an in-memory database.
//!
//! These run on the real clock with short timings; SQLite does its work on a
//! separate thread, which a paused test clock would race.

use std::time::Duration;

use anyhow::{Result, anyhow};
use xiaoba_crawler::crawling::{
    AccountOutcome, CrawlErrorKind, CrawlOrchestrator, NotificationHub, OrchestratorError,
};
use xiaoba_crawler::domain::{
    AccountRepository, AccountStatus, KeywordScanner, KeywordStatRepository, NaturalKey, RecordRepository,
};
use xiaoba_crawler::infrastructure::SharedConfig;
use xiaoba_crawler::test_utils::{
    LoginSite, ScriptedLauncher, TestContext, dashboard_html, dashboard_html_with, fast_timings,
    test_runtime_config,
};

fn standard_launcher() -> ScriptedLauncher {
    ScriptedLauncher::new(LoginSite::standard(dashboard_html(2)))
}

fn key(account: &str, sequence_number: i64) -> NaturalKey {
    NaturalKey {
        account_username: account.to_string(),
        sequence_number,
        ip: format!("10.0.0.{sequence_number}"),
    }
}

async fn status_of(ctx: &TestContext, username: &str) -> Result<AccountStatus> {
    ctx.database
        .accounts
        .find_by_username(username)
        .await?
        .map(|a| a.last_status)
        .ok_or_else(|| anyhow!("missing account {username}"))
}

#[tokio::test]
async fn failing_account_does_not_affect_the_others() -> Result<()> {
    let launcher = standard_launcher();
    launcher.set_site("bad", LoginSite::standard(dashboard_html(2)).rejecting_password());
    let ctx = TestContext::new(launcher).await?;
    ctx.add_accounts(&["alpha", "bad", "gamma"]).await?;

    let report = ctx.orchestrator.run_cycle().await?;

    assert_eq!((report.succeeded(), report.failed()), (2, 1));
    let bad = report.report_for("bad").ok_or_else(|| anyhow!("no report"))?;
    assert!(matches!(
        bad.outcome,
        AccountOutcome::Failed { kind: CrawlErrorKind::LoginTimeout, .. }
    ));
    assert_eq!(ctx.database.records.count().await?, 4);
    assert!(ctx.database.records.find_all(Some("bad")).await?.is_empty());

    assert_eq!(status_of(&ctx, "bad").await?, AccountStatus::Error);
    assert_eq!(status_of(&ctx, "alpha").await?, AccountStatus::Active);
    let alpha = ctx.database.accounts.find_by_username("alpha").await?;
    assert!(alpha.is_some_and(|a| a.last_crawl_at.is_some()));

    let probe = ctx.launcher.probe();
    assert_eq!(probe.open(), 0);
    assert_eq!(probe.closed(), 3);
    Ok(())
}

#[tokio::test]
async fn concurrent_sessions_never_exceed_the_limit() -> Result<()> {
    let launcher = ScriptedLauncher::new(LoginSite::standard(dashboard_html(1)).with_delay(Duration::from_millis(50)));
    let mut config = test_runtime_config();
    config.crawler.max_concurrent_sessions = 2;
    let ctx = TestContext::with_config(launcher, config).await?;
    ctx.add_accounts(&["a1", "a2", "a3", "a4", "a5"]).await?;

    let report = ctx.orchestrator.run_cycle().await?;

    assert_eq!(report.succeeded(), 5);
    let probe = ctx.launcher.probe();
    assert_eq!(probe.peak(), 2);
    assert_eq!(probe.launched(), 5);
    assert_eq!(probe.open(), 0);
    Ok(())
}

#[tokio::test]
async fn counters_accumulate_across_cycles() -> Result<()> {
    let ctx = TestContext::new(standard_launcher()).await?;
    ctx.add_accounts(&["KR666"]).await?;

    let mut accumulated = Vec::new();
    for current in [10, 15, 2, 1] {
        ctx.launcher
            .set_site("KR666", LoginSite::standard(dashboard_html_with(&[(1, current, "正常")])));
        let report = ctx.orchestrator.run_cycle().await?;
        assert_eq!(report.succeeded(), 1);

        let stored = ctx
            .database
            .records
            .find_by_key(&key("KR666", 1))
            .await?
            .ok_or_else(|| anyhow!("record not stored"))?;
        assert_eq!(stored.raw.count_current, current);
        accumulated.push(stored.accumulated_count);
    }

    assert_eq!(accumulated, [0, 0, 15, 16]);
    assert_eq!(ctx.database.records.count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn keyword_hits_are_totalled_and_pushed_to_subscribers() -> Result<()> {
    let launcher = ScriptedLauncher::new(LoginSite::standard(dashboard_html_with(&[
        (1, 3, "掉线 重连中"),
        (2, 4, "正常"),
    ])));
    let ctx = TestContext::new(launcher).await?;
    ctx.add_accounts(&["alpha", "beta"]).await?;
    let mut subscription = ctx.hub.subscribe();

    ctx.orchestrator.run_cycle().await?;

    let stats = ctx.database.keyword_stats.find_all().await?;
    let dropped = stats
        .iter()
        .find(|s| s.keyword == "掉线")
        .ok_or_else(|| anyhow!("keyword not counted"))?;
    assert_eq!(dropped.total_count, 2);
    assert_eq!(dropped.accounts_affected.len(), 2);

    let mut accounts = Vec::new();
    for _ in 0..2 {
        let update = tokio::time::timeout(Duration::from_secs(1), subscription.receiver.recv())
            .await?
            .ok_or_else(|| anyhow!("subscription closed"))?;
        assert_eq!(update.kind, "crawler_update");
        assert_eq!(update.data.len(), 2);
        accounts.push(update.account.clone());
    }
    accounts.sort();
    assert_eq!(accounts, ["alpha", "beta"]);
    Ok(())
}

#[tokio::test]
async fn launch_failures_and_panics_stay_inside_their_task() -> Result<()> {
    let launcher = standard_launcher();
    launcher.fail_launch("refused");
    launcher.panic_on_launch("crashy");
    let ctx = TestContext::new(launcher).await?;
    ctx.add_accounts(&["crashy", "fine", "refused"]).await?;

    let report = ctx.orchestrator.run_cycle().await?;

    let kind_of = |account: &str| {
        report.report_for(account).and_then(|r| match &r.outcome {
            AccountOutcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        })
    };
    assert_eq!(kind_of("refused"), Some(CrawlErrorKind::SessionLaunch));
    assert_eq!(kind_of("crashy"), Some(CrawlErrorKind::Panicked));
    assert!(report.report_for("fine").is_some_and(|r| r.is_success()));

    assert_eq!(status_of(&ctx, "crashy").await?, AccountStatus::Error);
    assert_eq!(status_of(&ctx, "refused").await?, AccountStatus::Error);
    assert_eq!(status_of(&ctx, "fine").await?, AccountStatus::Active);

    // a panicked task releases its engine lock
    let report = ctx.orchestrator.run_cycle().await?;
    assert_eq!(report.skipped(), 0);
    Ok(())
}

#[tokio::test]
async fn deadline_cancels_the_task_and_closes_its_session() -> Result<()> {
    let launcher = standard_launcher();
    launcher.set_site("slow", LoginSite::standard(dashboard_html(1)).with_delay(Duration::from_secs(30)));
    let mut config = test_runtime_config();
    config.crawler.task_deadline_secs = 1;
    let ctx = TestContext::with_config(launcher, config).await?;
    ctx.add_accounts(&["quick", "slow"]).await?;

    let report = ctx.orchestrator.run_cycle().await?;

    let slow = report.report_for("slow").ok_or_else(|| anyhow!("no report"))?;
    assert!(matches!(slow.outcome, AccountOutcome::Failed { kind: CrawlErrorKind::Deadline, .. }));
    assert!(report.report_for("quick").is_some_and(|r| r.is_success()));
    assert_eq!(ctx.launcher.probe().open(), 0);
    assert_eq!(status_of(&ctx, "slow").await?, AccountStatus::Error);
    Ok(())
}

#[tokio::test]
async fn busy_account_is_skipped_not_queued() -> Result<()> {
    let ctx = TestContext::new(standard_launcher()).await?;
    ctx.add_accounts(&["busy", "free"]).await?;

    let guard = ctx
        .orchestrator
        .registry()
        .try_acquire("busy", &KeywordScanner::default())
        .ok_or_else(|| anyhow!("engine unavailable"))?;
    let report = ctx.orchestrator.run_cycle().await?;
    drop(guard);

    assert_eq!(
        report.report_for("busy").map(|r| r.outcome.clone()),
        Some(AccountOutcome::Skipped)
    );
    assert!(report.report_for("free").is_some_and(|r| r.is_success()));
    assert_eq!(ctx.launcher.probe().launched(), 1);
    assert_eq!(status_of(&ctx, "busy").await?, AccountStatus::Idle);
    Ok(())
}

#[tokio::test]
async fn disabled_accounts_are_left_out_of_cycles_but_can_be_tested() -> Result<()> {
    let ctx = TestContext::new(standard_launcher()).await?;
    ctx.add_accounts(&["on", "off"]).await?;
    ctx.database.accounts.set_enabled("off", false).await?;

    let report = ctx.orchestrator.run_cycle().await?;
    assert_eq!(report.accounts.len(), 1);
    assert!(report.report_for("off").is_none());

    let tested = ctx.orchestrator.test_account("off").await?;
    assert!(matches!(tested.outcome, AccountOutcome::Succeeded { records: 2, .. }));

    let missing = ctx.orchestrator.test_account("nobody").await;
    assert!(matches!(missing, Err(OrchestratorError::AccountNotFound(ref name)) if name == "nobody"));
    Ok(())
}

#[tokio::test]
async fn scheduler_runs_until_stopped() -> Result<()> {
    let mut config = test_runtime_config();
    config.crawler.cycle_interval_secs = 1;
    let ctx = TestContext::with_config(standard_launcher(), config).await?;
    ctx.add_accounts(&["KR666"]).await?;

    ctx.orchestrator.start()?;
    assert!(ctx.orchestrator.is_running());
    assert!(matches!(ctx.orchestrator.start(), Err(OrchestratorError::AlreadyRunning)));

    let stored = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if ctx.database.records.count().await.unwrap_or_default() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(stored.is_ok(), "first scheduled cycle never stored records");

    ctx.orchestrator.stop().await?;
    assert!(!ctx.orchestrator.is_running());
    assert!(matches!(ctx.orchestrator.stop().await, Err(OrchestratorError::NotRunning)));
    assert_eq!(ctx.launcher.probe().open(), 0);

    let status = ctx.orchestrator.status().await?;
    assert_eq!(status.total_accounts, 1);
    assert_eq!(status.active_accounts, 1);
    assert_eq!(status.total_records, 2);
    assert!(status.last_update.is_some());
    assert!(!status.running);
    Ok(())
}

#[tokio::test]
async fn empty_table_is_reported_without_touching_status() -> Result<()> {
    let launcher = standard_launcher();
    launcher.set_site("quiet", LoginSite::standard(dashboard_html(0)));
    let ctx = TestContext::new(launcher).await?;
    ctx.add_accounts(&["quiet", "busy"]).await?;
    let mut subscription = ctx.hub.subscribe();

    let report = ctx.orchestrator.run_cycle().await?;

    assert_eq!((report.succeeded(), report.no_data(), report.failed()), (1, 1, 0));
    let quiet = report.report_for("quiet").ok_or_else(|| anyhow!("no report"))?;
    assert_eq!(quiet.outcome, AccountOutcome::NoData);
    assert_eq!(status_of(&ctx, "quiet").await?, AccountStatus::Idle);
    assert_eq!(status_of(&ctx, "busy").await?, AccountStatus::Active);

    let update = subscription.receiver.try_recv()?;
    assert_eq!(update.account, "busy");
    assert!(subscription.receiver.try_recv().is_err());
    assert_eq!(ctx.launcher.probe().closed(), 2);
    Ok(())
}

#[tokio::test]
async fn on_demand_cycles_run_normally_after_the_scheduler_stops() -> Result<()> {
    let mut config = test_runtime_config();
    config.crawler.cycle_interval_secs = 60;
    let ctx = TestContext::with_config(standard_launcher(), config).await?;
    ctx.add_accounts(&["KR1", "KR2", "KR3"]).await?;

    ctx.orchestrator.start()?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    ctx.orchestrator.stop().await?;

    let report = ctx.orchestrator.run_cycle().await?;
    assert_eq!(report.succeeded(), 3, "{:?}", report.accounts);

    let single = ctx.orchestrator.test_account("KR2").await?;
    assert!(single.is_success(), "{single:?}");

    ctx.orchestrator.start()?;
    assert!(ctx.orchestrator.is_running());
    ctx.orchestrator.stop().await?;
    Ok(())
}

#[tokio::test]
async fn restored_baseline_continues_accumulation() -> Result<()> {
    let ctx = TestContext::new(standard_launcher()).await?;
    ctx.add_accounts(&["KR666"]).await?;
    for current in [10, 15] {
        ctx.launcher
            .set_site("KR666", LoginSite::standard(dashboard_html_with(&[(1, current, "正常")])));
        ctx.orchestrator.run_cycle().await?;
    }

    let mut config = test_runtime_config();
    config.crawler.restore_baselines = true;
    let restarted = CrawlOrchestrator::new(
        SharedConfig::new(config),
        ctx.launcher.clone(),
        ctx.database.accounts.clone(),
        ctx.database.gateway(NotificationHub::new()),
    )?
    .with_timings(fast_timings());
    assert_eq!(restarted.restore_baselines().await?, 1);

    ctx.launcher
        .set_site("KR666", LoginSite::standard(dashboard_html_with(&[(1, 2, "正常")])));
    restarted.run_cycle().await?;

    let stored = ctx
        .database
        .records
        .find_by_key(&key("KR666", 1))
        .await?
        .ok_or_else(|| anyhow!("record not stored"))?;
    assert_eq!(stored.accumulated_count, 15);
    Ok(())
}
