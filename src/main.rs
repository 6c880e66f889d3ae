use std::sync::Arc;

use anyhow::Result;
use api::service::QueueService;
use clap::Parser;
use config::{Command, Config};
use domain::{entity::JobType, priority::priority_from_source, repository::JobRepository};
use infrastructure::{
    nats::{NatsStageHandler, NatsWake, Subjects},
    postgres::{run_migrations, PgJobRepository, PgLeaseRepository},
};
use pipeline::{
    dispatch::Pipeline,
    enqueuer::{Enqueued, Enqueuer},
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use worker::{
    burst::BurstWorker, drain::SingleShotDrain, lease::LeaseCoordinator, processor::Processor,
};

mod api;
mod config;
mod domain;
mod infrastructure;
mod pipeline;
mod task;
mod worker;

type Stages = Pipeline<PgJobRepository, NatsWake>;

const ADMIN_DRAIN_MAX: usize = 100;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    config::configure_tracing();

    config.validate()?;

    let pool = PgPoolOptions::new().connect(&config.database_url).await?;
    let jobs = PgJobRepository::new(pool.clone());

    match config.command.clone().unwrap_or(Command::Serve) {
        Command::Migrate => run_migrations(&pool).await?,
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&jobs.stats().await?)?);
        }
        Command::Show { id } => match jobs.load(id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => println!("job {} not found", id),
        },
        Command::Inspect { subject_key } => {
            let history = jobs.list_for_subject(&subject_key).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Command::Enqueue {
            subject_key,
            source,
            job_type,
        } => {
            let job_type: JobType = job_type.parse()?;
            let nc = async_nats::connect(&config.nats_url).await?;
            let enqueuer = Enqueuer::new(jobs, NatsWake::new(nc.clone(), &config.subjects()));

            match enqueuer
                .enqueue_and_wake(&subject_key, job_type, priority_from_source(&source))
                .await?
            {
                Enqueued::Created(job) => {
                    nc.flush().await.map_err(|e| anyhow::anyhow!("flush: {}", e))?;
                    println!("{}", serde_json::to_string_pretty(&job)?);
                }
                Enqueued::Duplicate => println!("not enqueued: {} already outstanding", job_type),
            }
        }
        Command::Drain { max } => {
            let nc = async_nats::connect(&config.nats_url).await?;
            let stages = build_pipeline(jobs.clone(), nc, &config.subjects());
            let processor = Processor::new(jobs, Arc::new(stages), config.retry_policy());

            if let Some(processed) = SingleShotDrain::new(Arc::new(processor)).run(max).await? {
                println!("processed {} job(s)", processed);
            }
        }
        Command::Serve => serve(&config, pool, jobs).await?,
    }

    Ok(())
}

fn build_pipeline(jobs: PgJobRepository, nc: async_nats::Client, subjects: &Subjects) -> Stages {
    let enqueuer = Enqueuer::new(jobs, NatsWake::new(nc.clone(), subjects));

    Pipeline::new(
        enqueuer,
        Arc::new(NatsStageHandler::new(nc.clone(), subjects, JobType::Hash)),
        Arc::new(NatsStageHandler::new(nc.clone(), subjects, JobType::Safety)),
        Arc::new(NatsStageHandler::new(nc, subjects, JobType::Embed)),
    )
}

async fn serve(config: &Config, pool: sqlx::PgPool, jobs: PgJobRepository) -> Result<()> {
    run_migrations(&pool).await?;

    let nc = async_nats::connect(&config.nats_url).await?;
    let subjects = config.subjects();

    let stages = build_pipeline(jobs.clone(), nc.clone(), &subjects);
    let processor = Arc::new(Processor::new(
        jobs.clone(),
        Arc::new(stages),
        config.retry_policy(),
    ));
    let burst = BurstWorker::new(
        LeaseCoordinator::new(PgLeaseRepository::new(pool), config.lease_name.clone()),
        processor.clone(),
        config.burst_config()?,
    );
    let service = QueueService::new(
        jobs,
        Arc::new(burst),
        SingleShotDrain::new(processor),
        ADMIN_DRAIN_MAX,
    );

    info!(lease = %config.lease_name, "Queue service started");

    tokio::select! {
        result = service.listen_wake(nc.clone(), &subjects, config.trigger_interval()) => {
            error!("Wake listener exited: {:?}", result);
        }
        result = service.listen_admin(nc, &subjects) => {
            error!("Admin listener exited: {:?}", result);
        }
    }

    info!("Exiting");

    Ok(())
}
