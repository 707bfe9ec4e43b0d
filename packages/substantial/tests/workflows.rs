use std::{
	sync::{
		atomic::{AtomicBool, AtomicU32, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use chrono::{DateTime, Utc};
use substantial::event::Stop;
use substantial::prelude::*;
use tokio::time::timeout;
use uuid::Uuid;

mod common;

#[tokio::test]
async fn simple_chain_records_every_save() {
	let (conductor, _root) = common::conductor();

	let workflow = Workflow::new("simple", |c: Context, _kwargs| async move {
		let r1: String = c.save(|| async { Ok("A".to_string()) }).await?;
		let r2: String = c
			.save({
				let r1 = r1.clone();
				move || async move { Ok(format!("B {r1}")) }
			})
			.await?;
		let r3: String = c
			.save({
				let r2 = r2.clone();
				move || async move { Ok(format!("C {r2}")) }
			})
			.await?;
		Ok(r3)
	});

	conductor.register(workflow.clone()).unwrap();
	let run = conductor.start(&workflow, Default::default()).await.unwrap();
	let agent = conductor.run_with(DEFAULT_QUEUE, common::fast_agent());

	let result: String = timeout(Duration::from_secs(20), run.result())
		.await
		.expect("run did not stop in time")
		.unwrap();
	assert_eq!(result, "C B A");

	agent.stop().await;

	let records = common::read_events(&conductor, run.run_id()).await;
	assert_eq!(
		common::saves(&records),
		vec![
			(1, "\"A\"".to_string(), -1),
			(2, "\"B A\"".to_string(), -1),
			(3, "\"C B A\"".to_string(), -1),
		]
	);
	assert!(matches!(
		common::last_stop(&records),
		Some(Stop::Ok(raw)) if raw == "\"C B A\""
	));
}

#[tokio::test]
async fn start_kwargs_reach_the_workflow() {
	let (conductor, _root) = common::conductor();

	let workflow = Workflow::new("greeter", |_c: Context, kwargs| async move {
		let name = kwargs
			.get("name")
			.and_then(|v| v.as_str())
			.unwrap_or("nobody")
			.to_string();
		Ok(format!("hello {name}"))
	});

	conductor.register(workflow.clone()).unwrap();

	let mut kwargs = serde_json::Map::new();
	kwargs.insert("name".to_string(), serde_json::json!("ada"));

	let run = conductor.start(&workflow, kwargs).await.unwrap();
	let agent = conductor.run_with(DEFAULT_QUEUE, common::fast_agent());

	let result: String = timeout(Duration::from_secs(20), run.result())
		.await
		.expect("run did not stop in time")
		.unwrap();
	assert_eq!(result, "hello ada");

	agent.stop().await;
}

#[tokio::test]
async fn retry_exhaustion_stops_with_the_failure_message() {
	let (conductor, _root) = common::conductor();
	let strategy = RetryStrategy::new(3, Some(1), Some(5)).unwrap();

	let workflow = Workflow::new("failing", move |c: Context, _kwargs| {
		let strategy = strategy.clone();
		async move {
			let _: String = c.save(|| async { Ok("A".to_string()) }).await?;
			let _: String = c
				.save(|| async { Err::<String, _>(anyhow::anyhow!("UNREACHABLE")) })
				.retry_strategy(strategy)
				.await?;
			Ok("unreachable".to_string())
		}
	});

	conductor.register(workflow.clone()).unwrap();
	let run = conductor.start(&workflow, Default::default()).await.unwrap();
	let agent = conductor.run_with(DEFAULT_QUEUE, common::fast_agent());

	let err = timeout(Duration::from_secs(30), run.result::<String>())
		.await
		.expect("run did not stop in time")
		.unwrap_err();
	assert_eq!(err.to_string(), "Exception: UNREACHABLE");

	agent.stop().await;

	let records = common::read_events(&conductor, run.run_id()).await;
	let saves = common::saves(&records);

	// one resolved save plus one failure record per consumed retry, counters
	// never exceeding max_retries
	assert_eq!(
		saves,
		vec![
			(1, "\"A\"".to_string(), -1),
			(2, "null".to_string(), 2),
			(2, "null".to_string(), 3),
		]
	);
	assert!(matches!(
		common::last_stop(&records),
		Some(Stop::Err(raw)) if raw == "\"Exception: UNREACHABLE\""
	));
}

#[tokio::test]
async fn activity_timeouts_are_failures() {
	let (conductor, _root) = common::conductor();
	let strategy = RetryStrategy::new(1, None, None).unwrap();

	let workflow = Workflow::new("slow", move |c: Context, _kwargs| {
		let strategy = strategy.clone();
		async move {
			let value: String = c
				.save(|| async {
					tokio::time::sleep(Duration::from_secs(30)).await;
					Ok("too late".to_string())
				})
				.timeout(Duration::from_millis(100))
				.retry_strategy(strategy)
				.await?;
			Ok(value)
		}
	});

	conductor.register(workflow.clone()).unwrap();
	let run = conductor.start(&workflow, Default::default()).await.unwrap();
	let agent = conductor.run_with(DEFAULT_QUEUE, common::fast_agent());

	let err = timeout(Duration::from_secs(20), run.result::<String>())
		.await
		.expect("run did not stop in time")
		.unwrap_err();
	assert!(
		err.to_string().starts_with("TimeoutError:"),
		"unexpected message: {err}"
	);

	agent.stop().await;
}

#[tokio::test]
async fn events_sleep_and_cancel_compose() {
	let (conductor, _root) = common::conductor();

	let workflow = Workflow::new("events", |c: Context, _kwargs| async move {
		let r1: String = c.save(|| async { Ok("A".to_string()) }).await?;
		let payload: String = c.receive("sayHello").await?;

		c.sleep(Duration::from_secs(4)).await?;

		let mut cancelled = false;
		c.handle("cancel", |_| cancelled = true)?;

		if c.ensure(|| cancelled)? {
			return Ok(format!("{payload} B {r1}"));
		}

		Ok(String::new())
	});

	conductor.register(workflow.clone()).unwrap();
	let run = conductor.start(&workflow, Default::default()).await.unwrap();
	let agent = conductor.run_with(DEFAULT_QUEUE, common::fast_agent());

	let timeline = {
		let run = run.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_secs(1)).await;
			run.send("sayHello", "Hello from outside!").await.unwrap();

			tokio::time::sleep(Duration::from_millis(1500)).await;
			run.send("cancel", serde_json::Value::Null).await.unwrap();
		})
	};

	let result: String = timeout(Duration::from_secs(30), run.result())
		.await
		.expect("run did not stop in time")
		.unwrap();
	assert_eq!(result, "Hello from outside! B A");

	timeline.await.unwrap();
	agent.stop().await;

	let records = common::read_events(&conductor, run.run_id()).await;
	let sends = records
		.events
		.iter()
		.filter_map(|record| match &record.event {
			substantial::event::Event::Send(send) => Some(send.name.clone()),
			_ => None,
		})
		.collect::<Vec<_>>();
	assert_eq!(sends, vec!["sayHello", "cancel"]);
}

#[tokio::test]
async fn utilities_replay_their_first_values() {
	let (conductor, _root) = common::conductor();

	let observed: Arc<Mutex<Vec<(DateTime<Utc>, i64, Uuid)>>> = Arc::new(Mutex::new(Vec::new()));
	let invocations = Arc::new(AtomicU32::new(0));

	let workflow = Workflow::new("nondeterministic", {
		let observed = observed.clone();
		let invocations = invocations.clone();
		move |c: Context, _kwargs| {
			let observed = observed.clone();
			let invocations = invocations.clone();
			async move {
				let _: u32 = c
					.save({
						let invocations = invocations.clone();
						move || async move { Ok(invocations.fetch_add(1, Ordering::SeqCst) + 1) }
					})
					.await?;

				let now = c.utils().now().await?;
				let rolled = c.utils().random(0, 1_000_000).await?;
				let id = c.utils().uuid4().await?;

				observed.lock().unwrap().push((now, rolled, id));

				c.sleep(Duration::from_secs(1)).await?;

				Ok(format!("{rolled}"))
			}
		}
	});

	conductor.register(workflow.clone()).unwrap();
	let run = conductor.start(&workflow, Default::default()).await.unwrap();
	let agent = conductor.run_with(DEFAULT_QUEUE, common::fast_agent());

	let _: String = timeout(Duration::from_secs(20), run.result())
		.await
		.expect("run did not stop in time")
		.unwrap();

	agent.stop().await;

	// the sleep forces at least one extra replay, yet the recorded values
	// never change and the instrumented save ran exactly once
	let observed = observed.lock().unwrap();
	assert!(observed.len() >= 2, "expected at least two replays");
	assert!(observed.windows(2).all(|w| w[0] == w[1]));
	assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parallel_runs_do_not_leak_into_each_other() {
	let (conductor, _root) = common::conductor();

	let first = Workflow::new("first", |c: Context, _kwargs| async move {
		let v: String = c.save(|| async { Ok("first".to_string()) }).await?;
		Ok(v)
	});
	let second = Workflow::new("second", |c: Context, _kwargs| async move {
		let v: String = c.save(|| async { Ok("second 1".to_string()) }).await?;
		let v: String = c
			.save({
				let v = v.clone();
				move || async move { Ok(format!("{v} 2")) }
			})
			.await?;
		c.sleep(Duration::from_secs(1)).await?;
		let v: String = c
			.save({
				let v = v.clone();
				move || async move { Ok(format!("{v} 3")) }
			})
			.await?;
		Ok(v)
	});

	conductor.register(first.clone()).unwrap();
	conductor.register(second.clone()).unwrap();

	let run_1 = conductor.start(&first, Default::default()).await.unwrap();
	let run_2 = conductor.start(&second, Default::default()).await.unwrap();
	let agent = conductor.run_with(DEFAULT_QUEUE, common::fast_agent());

	let result_1: String = timeout(Duration::from_secs(30), run_1.result())
		.await
		.expect("first run did not stop in time")
		.unwrap();
	let result_2: String = timeout(Duration::from_secs(30), run_2.result())
		.await
		.expect("second run did not stop in time")
		.unwrap();

	assert_eq!(result_1, "first");
	assert_eq!(result_2, "second 1 2 3");

	agent.stop().await;

	let records_1 = common::read_events(&conductor, run_1.run_id()).await;
	let records_2 = common::read_events(&conductor, run_2.run_id()).await;
	assert_eq!(common::saves(&records_1).len(), 1);
	assert_eq!(common::saves(&records_2).len(), 3);

	let filter = conductor.filter();
	assert_eq!(
		filter.related_runs("first").await.unwrap(),
		vec![run_1.run_id().to_string()]
	);
	assert_eq!(
		filter.related_runs("second").await.unwrap(),
		vec![run_2.run_id().to_string()]
	);
}

#[tokio::test]
async fn failed_saves_compensate_completed_ones_in_reverse() {
	let (conductor, _root) = common::conductor();

	let fourth_ran = Arc::new(AtomicBool::new(false));
	let strategy = RetryStrategy::new(1, None, None).unwrap();

	let workflow = Workflow::new("banking", {
		let fourth_ran = fourth_ran.clone();
		move |c: Context, _kwargs| {
			let fourth_ran = fourth_ran.clone();
			let strategy = strategy.clone();
			async move {
				let _: String = c
					.save(|| async { Ok("deposit A".to_string()) })
					.compensate_with(|| async { Ok("undo A") })
					.await?;
				let _: String = c
					.save(|| async { Ok("deposit B".to_string()) })
					.compensate_with(|| async { Ok("undo B") })
					.await?;
				let _: String = c
					.save(|| async { Err::<String, _>(anyhow::anyhow!("insufficient funds")) })
					.retry_strategy(strategy)
					.compensate_with(|| async { Ok("undo C") })
					.await?;
				let _: String = c
					.save({
						let fourth_ran = fourth_ran.clone();
						move || async move {
							fourth_ran.store(true, Ordering::SeqCst);
							Ok("deposit D".to_string())
						}
					})
					.await?;
				Ok("done".to_string())
			}
		}
	});

	conductor.register(workflow.clone()).unwrap();
	let run = conductor.start(&workflow, Default::default()).await.unwrap();
	let agent = conductor.run_with(DEFAULT_QUEUE, common::fast_agent());

	let err = timeout(Duration::from_secs(20), run.result::<String>())
		.await
		.expect("run did not stop in time")
		.unwrap_err();
	assert_eq!(err.to_string(), "Exception: insufficient funds");

	agent.stop().await;
	assert!(!fourth_ran.load(Ordering::SeqCst));

	let records = common::read_events(&conductor, run.run_id()).await;

	let compensations = common::compensations(&records);
	assert_eq!(compensations.len(), 3);
	assert!(compensations
		.iter()
		.all(|(save_id, error, _)| *save_id == 3 && error == "insufficient funds"));
	assert_eq!(
		compensations
			.iter()
			.map(|(_, _, result)| result.as_str())
			.collect::<Vec<_>>(),
		vec!["\"undo C\"", "\"undo B\"", "\"undo A\""]
	);

	assert!(matches!(common::last_stop(&records), Some(Stop::Err(_))));
}

#[tokio::test]
async fn sends_after_stop_are_never_folded() {
	let (conductor, _root) = common::conductor();

	let workflow = Workflow::new("short", |c: Context, _kwargs| async move {
		let v: String = c.save(|| async { Ok("done".to_string()) }).await?;
		Ok(v)
	});

	conductor.register(workflow.clone()).unwrap();
	let run = conductor.start(&workflow, Default::default()).await.unwrap();
	let agent = conductor.run_with(DEFAULT_QUEUE, common::fast_agent());

	let _: String = timeout(Duration::from_secs(20), run.result())
		.await
		.expect("run did not stop in time")
		.unwrap();

	let before = common::read_events(&conductor, run.run_id()).await.events.len();

	// the late send is scheduled but the replay never folds it in
	run.send("late", "ignored").await.unwrap();
	tokio::time::sleep(Duration::from_secs(2)).await;

	agent.stop().await;

	let records = common::read_events(&conductor, run.run_id()).await;
	assert_eq!(records.events.len(), before);
	assert!(records
		.events
		.iter()
		.all(|r| !matches!(&r.event, substantial::event::Event::Send(_))));
}

#[tokio::test]
async fn cancelled_runs_never_record_a_stop() {
	let (conductor, _root) = common::conductor();

	let workflow = Workflow::new("cancelled", |c: Context, _kwargs| async move {
		let _: String = c.save(|| async { Ok("A".to_string()) }).await?;
		Err::<String, _>(c.cancel_run())
	});

	conductor.register(workflow.clone()).unwrap();
	let run = conductor.start(&workflow, Default::default()).await.unwrap();
	let agent = conductor.run_with(DEFAULT_QUEUE, common::fast_agent());

	tokio::time::sleep(Duration::from_secs(2)).await;
	agent.stop().await;

	let records = common::read_events(&conductor, run.run_id()).await;
	assert!(common::last_stop(&records).is_none());
	assert_eq!(common::saves(&records), vec![(1, "\"A\"".to_string(), -1)]);

	// terminal without a stop: nothing left on the schedule
	assert!(conductor
		.backend()
		.next_run(DEFAULT_QUEUE, &[])
		.await
		.unwrap()
		.is_none());
}

#[tokio::test]
async fn restored_runs_replay_the_source_history() {
	let (conductor, _root) = common::conductor();

	let invocations = Arc::new(AtomicU32::new(0));

	let make = |name: &str, invocations: Arc<AtomicU32>| {
		Workflow::new(name, move |c: Context, _kwargs| {
			let invocations = invocations.clone();
			async move {
				let value: u32 = c
					.save({
						let invocations = invocations.clone();
						move || async move { Ok(invocations.fetch_add(1, Ordering::SeqCst)) }
					})
					.await?;
				Ok(value)
			}
		})
	};

	let source = make("seed", invocations.clone());
	conductor.register(source.clone()).unwrap();

	let run_1 = conductor.start(&source, Default::default()).await.unwrap();
	let agent = conductor.run_with(DEFAULT_QUEUE, common::fast_agent());

	let first: u32 = timeout(Duration::from_secs(20), run_1.result())
		.await
		.expect("seed run did not stop in time")
		.unwrap();
	assert_eq!(first, 0);

	// a fresh run bootstrapped from the seed's log reuses its saves
	let restored = make("revision", invocations.clone()).restore_using(run_1.run_id());
	conductor.register(restored.clone()).unwrap();

	let run_2 = conductor.start(&restored, Default::default()).await.unwrap();
	let second: u32 = timeout(Duration::from_secs(20), run_2.result())
		.await
		.expect("restored run did not stop in time")
		.unwrap();

	assert_eq!(second, 0);
	assert_eq!(invocations.load(Ordering::SeqCst), 1);

	agent.stop().await;
}
