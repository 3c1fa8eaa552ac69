use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use ride_reserve::cache::{MemoryCache, spawn_sweep_task};
use ride_reserve::config::EngineConfig;
use ride_reserve::error::ReservationError;
use ride_reserve::reservation::service::Stores;
use ride_reserve::reservation::{Answer, Coordinates, ReservationRecord, ReservationService, Step, StepOutcome};
use ride_reserve::store::LibSqlBackend;
use ride_reserve::travel::TravelTimeService;
use ride_reserve::validate::ServiceArea;

const LOCAL_USER: &str = "local-user";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env()?;

    eprintln!("🚕 Ride Reserve v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.store.db_path.display());
    eprintln!("   Session TTL: {}s", config.reservation.session_ttl.as_secs());
    eprintln!("   Prefix a line with @<user> to act as another rider. /quit to exit.\n");

    // ── Storage ─────────────────────────────────────────────────────────
    let db = Arc::new(LibSqlBackend::new_local(&config.store.db_path).await?);
    let cache = Arc::new(MemoryCache::new());
    let _sweep_handle = spawn_sweep_task(cache.clone(), Duration::from_secs(60));

    let area = ServiceArea::load(config.reservation.service_area_path.as_deref())?;
    let service = ReservationService::new(cache, Stores::from_backend(db), area, &config);
    let travel = TravelTimeService::from_config(&config.travel)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    // ── REPL ────────────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprint!("> ");
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            eprint!("> ");
            continue;
        }
        if line == "/quit" {
            break;
        }

        let (user, input) = split_user(line);
        if let Err(e) = handle(&service, &travel, &shutdown, user, input).await {
            tracing::error!(user, error = %e, "Request failed");
            println!("Sorry, something went wrong: {e}");
        }
        eprint!("> ");
    }

    eprintln!("\nGoodbye.");
    Ok(())
}

/// `@alice to the station` → (`alice`, `to the station`).
fn split_user(line: &str) -> (&str, &str) {
    match line.strip_prefix('@').and_then(|rest| rest.split_once(' ')) {
        Some((user, rest)) if !user.is_empty() => (user, rest.trim()),
        _ => (LOCAL_USER, line),
    }
}

/// `geo:lon,lat`, `place:<id>` or plain text.
fn parse_answer(input: &str) -> Answer {
    if let Some(pair) = input.strip_prefix("geo:") {
        if let Some((lon, lat)) = pair.split_once(',') {
            if let (Ok(lon), Ok(lat)) = (lon.trim().parse(), lat.trim().parse()) {
                return Answer::Coordinates(Coordinates::new(lon, lat));
            }
        }
    }
    if let Some(id) = input.strip_prefix("place:").and_then(|id| id.trim().parse().ok()) {
        return Answer::Place(id);
    }
    Answer::text(input)
}

async fn handle(
    service: &ReservationService,
    travel: &TravelTimeService,
    shutdown: &CancellationToken,
    user: &str,
    input: &str,
) -> Result<(), ride_reserve::Error> {
    match input.split_once(' ').unwrap_or((input, "")) {
        ("/cancel", _) => {
            let c = service.cancel(user).await?;
            match c.trip_id {
                Some(id) => println!("Trip #{id} cancelled."),
                None if c.sessions_removed > 0 => println!("Reservation discarded."),
                None => println!("Nothing to cancel."),
            }
        }
        ("/reset", _) => {
            service.reset(user).await?;
            println!("Session cleared.");
        }
        ("/status", _) => match service.find_record(user).await {
            Ok(record) => print_record(&record),
            Err(ReservationError::NotFound { .. }) => println!("No reservation."),
            Err(e) => return Err(e.into()),
        },
        ("/places", _) => {
            for place in service.popular_places(user, 4).await? {
                println!("  place:{}  {}", place.id, place.name);
            }
        }
        ("/rate", args) => {
            let mut parts = args.split_whitespace();
            match (
                parts.next().and_then(|s| s.parse().ok()),
                parts.next().and_then(|s| s.parse().ok()),
            ) {
                (Some(trip_id), Some(rating)) => {
                    service.save_trip_feedback(trip_id, rating).await?;
                    println!("Thanks for the feedback!");
                }
                _ => println!("Usage: /rate <trip id> <1-5>"),
            }
        }
        _ => {
            let outcome = service.process_step(user, parse_answer(input)).await?;
            if let StepOutcome::Rejected { reason, .. } = &outcome {
                println!("{reason}");
            }
            let mut record = outcome.into_record();
            if record.state == Step::Done {
                match travel.estimate(&record, shutdown).await {
                    Ok(route) => {
                        println!(
                            "Estimated drive: {} min ({:.1} km, {})",
                            route.expected_duration().as_secs().div_ceil(60),
                            route.distance / 1000.0,
                            route.source
                        );
                        match service.attach_route(user, &route).await {
                            Ok(updated) => record = updated,
                            Err(e) => tracing::warn!(user, error = %e, "Route not stored"),
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "No travel estimate"),
                }
            }
            print_record(&record);
        }
    }
    Ok(())
}

fn print_record(record: &ReservationRecord) {
    if let Some(id) = record.trip_id {
        println!("Trip #{id}: {} → {}", record.from, record.to);
        if let Some(at) = record.reserved_at {
            println!("Pickup at {}", at.format("%Y-%m-%d %H:%M UTC"));
        }
    }
    println!("{}", prompt_for(record.waiting));
}

fn prompt_for(step: Step) -> &'static str {
    match step {
        Step::Init | Step::To => "Where would you like to go?",
        Step::From => "Where should we pick you up? Send geo:<lon>,<lat> or a place name.",
        Step::When => "When? (now, +15min, +1 hour)",
        Step::NumPassengers => "How many passengers?",
        Step::Final => "Type confirm to book.",
        Step::Done | Step::Pickup => "Your ride is booked. Send a new time to change the pickup, or /cancel.",
    }
}
