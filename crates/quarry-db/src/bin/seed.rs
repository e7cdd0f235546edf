//! # Seed and Walkthrough
//!
//! Populates a database with teams and members, then runs a sample of
//! repository methods against it.
//!
//! ## Usage
//! ```bash
//! # Seed ./quarry_dev.db with 40 members (default)
//! cargo run -p quarry-db --bin seed
//!
//! # Custom amount and database
//! cargo run -p quarry-db --bin seed -- --count 200 --db ./data/quarry.db
//!
//! # Read settings from a config file
//! cargo run -p quarry-db --bin seed -- --config ./quarry.toml
//! ```
//!
//! Set `RUST_LOG=quarry=debug` with `log_statements = true` to see every
//! rendered statement.

use quarry_core::{Member, PageRequest, Sort, Team};
use quarry_db::{Database, QuarryConfig};
use std::env;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const TEAMS: &[&str] = &["teamA", "teamB", "teamC", "teamD"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,quarry=debug,sqlx=warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut count: usize = 40;
    let mut db_path: Option<String> = None;
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(40);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--config" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Quarry Seed and Walkthrough");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>      Number of members to generate (default: 40)");
                println!("  -d, --db <PATH>      Database file path (default: ./quarry_dev.db)");
                println!("      --config <PATH>  Config file (default: quarry.toml)");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let mut config = QuarryConfig::load(config_path)?;
    match db_path {
        Some(path) => config.database.path = PathBuf::from(path),
        None if config.database.path == QuarryConfig::default().database.path => {
            config.database.path = PathBuf::from("./quarry_dev.db");
        }
        None => {}
    }

    println!("Quarry Seed and Walkthrough");
    println!("===========================");
    println!("Database: {}", config.database.path.display());
    println!("Members:  {}", count);
    println!();

    let db = Database::new(config.db_config()).await?;

    // -------------------------------------------------------------------------
    // Seed
    // -------------------------------------------------------------------------

    let mut uow = db.begin().await?;
    let existing = db.members().count(&mut uow).await?;
    if existing > 0 {
        println!("Database already has {} members, skipping seed", existing);
    } else {
        let start = std::time::Instant::now();
        let mut teams = Vec::new();
        for name in TEAMS {
            teams.push(db.teams().save(&mut uow, Team::new(name)).await?);
        }
        for n in 0..count {
            let username = format!("member{}", n + 1);
            let age = 10 + (n % 40) as i32;
            let member = match n % 5 {
                // every fifth member has no team
                4 => Member::new(&username, age),
                _ => Member::with_team(&username, age, &teams[n % teams.len()]),
            };
            db.members().save(&mut uow, member).await?;
        }
        info!(members = count, teams = teams.len(), elapsed = ?start.elapsed(), "Seed complete");
    }
    uow.commit().await?;

    // -------------------------------------------------------------------------
    // Walkthrough
    // -------------------------------------------------------------------------

    let mut uow = db.begin().await?;

    let page = db
        .members()
        .find_by_age(&mut uow, 10, PageRequest::sorted(0, 3, Sort::by_desc(&["username"]))?)
        .await?;
    println!(
        "findByAge(10): page {} of {}, {} total",
        page.number + 1,
        page.total_pages(),
        page.total_elements
    );

    let before = uow.stats();
    let members = db.members().find_member_custom(&mut uow).await?;
    for member in members.iter().take(5) {
        uow.load_reference(&member.team).await?;
    }
    let lazy = uow.stats();
    db.members().find_all(&mut uow).await?;
    let graph = uow.stats();
    println!(
        "lazy teams: {} round trips, entity graph: {} round trip",
        lazy.round_trips - before.round_trips,
        graph.round_trips - lazy.round_trips
    );

    let dtos = db.members().find_member_dto(&mut uow).await?;
    println!("findMemberDto: {} members with a team", dtos.len());

    let native = db
        .members()
        .find_by_native_projection(&mut uow, PageRequest::of(0, 5)?)
        .await?;
    for row in &native.content {
        println!(
            "  #{} {} ({})",
            row.id,
            row.username,
            row.team_name.as_deref().unwrap_or("no team")
        );
    }

    let locked = db.members().find_lock_by_username(&mut uow, "member1").await?;
    println!("findLockByUsername: {} row(s) under the write lock", locked.len());

    let bulk = db.members().bulk_age_plus(&mut uow, 40).await?;
    println!("bulkAgePlus(40): {} rows updated", bulk.affected);

    // walkthrough changes are not kept
    uow.rollback().await?;

    println!();
    println!("Done.");
    Ok(())
}
