use crate::Command;
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use session_orchestrator::{
    GameOrchestrator,
    actions::status_line,
    config::{
        ConfigStore,
        NetworkEnv,
        OrchestratorConfig,
    },
    gateway_client::GatewayClient,
    notifications::Notice,
    types::{
        Address,
        GameSession,
    },
};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

pub struct Settings {
    pub env: NetworkEnv,
    pub config_path: Option<String>,
    pub gateway_url: Option<String>,
    pub identity: Address,
}

fn load_config(settings: &Settings) -> Result<OrchestratorConfig> {
    let store = match settings.config_path.as_deref() {
        Some(raw) => ConfigStore::at(raw),
        None => ConfigStore::new(settings.env),
    };
    let mut config = store
        .load()
        .wrap_err("loading orchestrator config")?
        .ok_or_else(|| {
            eyre!(
                "No {} config found at {}. Write one with the deployed contract addresses.",
                settings.env,
                store.path().display()
            )
        })?;
    if let Some(url) = &settings.gateway_url {
        config.network.gateway_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

pub async fn run(settings: Settings, command: Command) -> Result<()> {
    let config = load_config(&settings)?;
    let client = GatewayClient::new(
        config.network.gateway_url.clone(),
        config.contracts.clone(),
    )?;
    info!(%client, identity = %settings.identity, "starting");
    let orchestrator = GameOrchestrator::new(client, config, settings.identity)?;
    let context = orchestrator
        .connect()
        .await
        .map_err(|e| eyre!("{}", e.user_message))?;
    println!(
        "Connected to chain {} as {} (game {})",
        context.chain_id, context.identity, context.game
    );
    if !orchestrator.sync().await {
        println!("Warning: could not read the ledger; showing the last known state.");
    }

    let result = dispatch(&orchestrator, command).await;
    orchestrator.shutdown();
    result
}

async fn dispatch(orchestrator: &GameOrchestrator<GatewayClient>, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            print_session(&orchestrator.session());
            let actions = orchestrator.available_actions();
            println!(
                "Actions: bet={} resolve={} recover={} reset={}",
                actions.can_place_bet, actions.can_resolve, actions.can_recover, actions.can_reset
            );
            if let Some(allowance) = orchestrator.last_seen_allowance() {
                println!("Allowance: {}", allowance.amount);
            }
        }
        Command::Bet { value, wager } => {
            if orchestrator.session().phase.is_terminal() {
                orchestrator.reset()?;
            }
            let session = orchestrator.place_bet(value, wager).await?;
            print_session(&session);
        }
        Command::Resolve => {
            let session = orchestrator.resolve().await?;
            print_session(&session);
        }
        Command::Recover { force } => {
            let session = if force {
                orchestrator.force_recover().await?
            } else {
                wait_for_stall(orchestrator).await?;
                orchestrator.recover().await?
            };
            print_session(&session);
        }
        Command::Watch => watch(orchestrator).await?,
        Command::Stats => {
            let stats = orchestrator.player_stats().await?;
            println!("Games played:   {}", stats.games_played);
            println!("Games won:      {}", stats.games_won);
            println!("Total wagered:  {}", stats.total_wagered);
            println!("Total paid out: {}", stats.total_paid_out);
        }
        Command::History { limit } => {
            let history = orchestrator.recent_history(limit).await?;
            if history.is_empty() {
                println!("No settled games yet.");
            }
            for entry in history {
                let rolled = entry
                    .rolled_value
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} #{} chose {} rolled {} wager {} payout {} ({:?})",
                    entry.settled_at.format("%Y-%m-%d %H:%M"),
                    entry.request_id,
                    entry.chosen_value,
                    rolled,
                    entry.wager_amount,
                    entry.payout,
                    entry.status
                );
            }
        }
    }
    Ok(())
}

/// The stall clock starts when this process first sees the game, so a plain
/// recover waits for the watcher to flag it.
async fn wait_for_stall(orchestrator: &GameOrchestrator<GatewayClient>) -> Result<()> {
    let session = orchestrator.session();
    if session.stuck || !session.phase.can_stall() {
        return Ok(());
    }
    println!(
        "Waiting up to {:?} for the game to be flagged stuck. Use --force to submit now.",
        orchestrator.config().recovery.stuck_threshold()
    );
    tokio::select! {
        _ = orchestrator.wait_until_stuck() => Ok(()),
        res = tokio::signal::ctrl_c() => {
            res.wrap_err("listening for interrupt")?;
            Err(eyre!("interrupted before the game was flagged stuck"))
        }
    }
}

async fn watch(orchestrator: &GameOrchestrator<GatewayClient>) -> Result<()> {
    let mut session = orchestrator.subscribe();
    let mut notices = orchestrator.notices();
    print_session(&session.borrow_and_update());
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                match res {
                    Ok(()) => info!("Received interrupt, exiting"),
                    Err(_) => tracing::warn!("Received interrupt error, exiting anyway"),
                }
                return Ok(());
            }
            changed = session.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = session.borrow_and_update().clone();
                print_session(&current);
                if current.phase.is_terminal() {
                    return Ok(());
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => print_notice(&notice),
                Err(RecvError::Lagged(skipped)) => println!("({skipped} notices skipped)"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn print_session(session: &GameSession) {
    println!("[{}] {}", session.phase, status_line(session));
    if let Some(error) = &session.last_error {
        println!("  last error: {}", error.user_message);
    }
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::PhaseChanged { .. } | Notice::AllowanceObserved(_) => {}
        Notice::Error { component, error } => {
            println!("  {component:?}: {}", error.user_message);
        }
        Notice::StateUnknown { attempts, .. } => {
            println!("  ledger unreachable after {attempts} attempts; state may be stale");
        }
        Notice::StuckDetected { phase, .. } => {
            println!("  game looks stuck while {phase}; `recover` is available");
        }
    }
}
