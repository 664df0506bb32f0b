//! A small end-to-end session: one scenario, a shared connection pool,
//! a feed of request ids, and a ramping load profile.
//!
//! Run with `cargo run --example http`.

use std::time::Duration;

use stampede::{
    ConnectionPoolArgs, Feed, LoadSimulation, Response, Scenario, SessionCoordinator, Step,
    StepContext, StdoutReporter,
};

/// Stand-in for a protocol client; a real run would hold e.g. a reqwest
/// or redis client here.
struct ApiClient {
    endpoint: String,
}

impl ApiClient {
    async fn get(&self, path: &str) -> Result<Vec<u8>, std::io::Error> {
        // simulate a network round-trip
        tokio::time::sleep(Duration::from_millis(25)).await;
        Ok(format!("{}{path}", self.endpoint).into_bytes())
    }
}

#[tokio::main]
async fn main() -> Result<(), stampede::AppError> {
    let pool = ConnectionPoolArgs::new(
        "api",
        8,
        |index, _ctx| async move {
            Ok(ApiClient {
                endpoint: format!("http://localhost:3000/shard/{index}"),
            })
        },
        |_client: std::sync::Arc<ApiClient>, _ctx| async move { Ok(()) },
    );
    let ids = Feed::circular("user ids", (1u64..=500).collect::<Vec<_>>());

    let fetch = Step::new("fetch user", |ctx: StepContext| async move {
        let Some(client) = ctx.connection::<ApiClient>() else {
            return Response::fail();
        };
        let Some(id) = ctx.feed_item::<u64>() else {
            return Response::fail();
        };
        match client.get(&format!("/users/{id}")).await {
            Ok(body) => Response::ok_data(body),
            Err(_) => Response::fail(),
        }
    })
    .with_pool(pool)
    .with_feed(ids);

    let scenario = Scenario::builder()
        .name("browse users")
        .steps(vec![fetch, Step::pause(Duration::from_millis(100))])
        .warm_up_duration(Some(Duration::from_secs(5)))
        .load_simulations(vec![
            LoadSimulation::RampConstant {
                copies: 50,
                during: Duration::from_secs(30),
            },
            LoadSimulation::KeepConstant {
                copies: 50,
                during: Duration::from_secs(60),
            },
        ])
        .build();

    let stats = SessionCoordinator::new(vec![scenario])
        .with_reporter(StdoutReporter)
        .run()
        .await?;

    for scenario in &stats.scenario_stats {
        for step in &scenario.step_stats {
            println!(
                "{}/{}: ok {} fail {} mean {:.1} ms",
                step.scenario_name, step.step_name, step.ok_count, step.fail_count, step.mean_ms
            );
        }
    }
    Ok(())
}
