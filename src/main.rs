use std::{process, sync::Arc};

use ciak::{
    application::error::AppError,
    application::pipeline::RenderPipeline,
    application::pipeline::validate::{SyntaxValidator, Validation},
    config,
    domain::job::JobId,
    domain::repair::repair,
    infra::{
        error::InfraError,
        http::{HttpState, build_router},
        telemetry,
        workspace::Workspace,
    },
};
use time::OffsetDateTime;
use tracing::{Dispatch, Level, dispatcher, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        tracing::error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        tracing::error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Check(args) => run_check(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let workspace = Arc::new(
        Workspace::new(&settings.workspace)
            .map_err(|err| AppError::unexpected(format!("failed to prepare workspace: {err}")))?,
    );
    let pipeline = Arc::new(RenderPipeline::new(&settings, workspace.clone()));
    let router = build_router(HttpState {
        pipeline,
        workspace,
    });

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "ciak::serve",
        addr = %settings.server.addr,
        "listening"
    );

    axum::serve(listener, router.into_make_service())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}

async fn run_check(settings: config::Settings, args: config::CheckArgs) -> Result<(), AppError> {
    let original = tokio::fs::read_to_string(&args.file)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let repaired = repair(&original);
    let changed = repaired != original;
    if changed {
        info!(
            target = "ciak::check",
            file = %args.file.display(),
            "repair pass changed the scene source"
        );
        if args.write {
            tokio::fs::write(&args.file, &repaired)
                .await
                .map_err(|err| AppError::from(InfraError::from(err)))?;
        }
    }

    let workspace = Workspace::new(&settings.workspace)
        .map_err(|err| AppError::unexpected(format!("failed to prepare workspace: {err}")))?;
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let staged = workspace
        .stage_source(&JobId::from_millis(millis), &repaired)
        .await
        .map_err(|err| AppError::unexpected(format!("failed to stage scene source: {err}")))?;

    let validator = SyntaxValidator::new(&settings.toolchain);
    let validation = validator
        .validate(staged.path())
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    staged.discard().await;

    match validation {
        Validation::Valid => {
            info!(
                target = "ciak::check",
                file = %args.file.display(),
                repaired = changed,
                "scene compiles cleanly"
            );
            Ok(())
        }
        Validation::Unavailable => {
            warn!(
                target = "ciak::check",
                "check command unavailable; repair-only run"
            );
            Ok(())
        }
        Validation::Invalid { diagnostics } => Err(AppError::validation(diagnostics)),
    }
}
