mod common;

use bytes::Bytes;
use common::{client_config, init_tracing, MockOptions, MockPlc};
use futures::future::join_all;
use s7_client::{
    BlockType, ConnectionState, Error, S7Area, S7Client, S7ReturnCode, S7TransportSize,
    S7VarSpec, SessionEvent, Tsap, WriteItem,
};
use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};
use tokio::time::timeout;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn write_then_read_back_one_kilobyte_over_negotiated_pdu() {
    init_tracing();
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = S7Client::new(client_config(&plc).with_pdu_size(960)).unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Ready);

    let ctx = client.context().unwrap();
    assert_eq!(ctx.pdu_size, 480);
    assert_eq!(ctx.local_tsap, Tsap(0x0100));
    assert_eq!(ctx.remote_tsap, Tsap(0x0300));
    assert_eq!(
        plc.stats.connect_tsaps.lock().unwrap()[0],
        (Some(0x0100), Some(0x0300))
    );
    assert_eq!(plc.stats.setup_requests.lock().unwrap()[0].pdu_size, 960);

    let data = pattern(1000);
    client
        .write(S7Area::DB, 250, 0, Bytes::from(data.clone()))
        .await
        .unwrap();
    assert_eq!(plc.stats.write_pdus.load(Ordering::SeqCst), 3);
    assert_eq!(plc.db(250), data);

    let back = client
        .read(S7Area::DB, 250, 0, S7TransportSize::Byte, 1000)
        .await
        .unwrap();
    assert_eq!(&back[..], &data[..]);
    assert_eq!(plc.stats.read_pdus.load(Ordering::SeqCst), 3);

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client.context().is_none());
}

#[tokio::test]
async fn small_tpdu_segments_requests_and_replies() {
    init_tracing();
    let plc = MockPlc::start(MockOptions {
        max_tpdu_code: 0x08,
        ..Default::default()
    })
    .await;
    let client = S7Client::new(client_config(&plc)).unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.context().unwrap().frame_size, 256);

    let data = pattern(1000);
    client
        .write(S7Area::DB, 7, 10, Bytes::from(data.clone()))
        .await
        .unwrap();
    let back = client
        .read(S7Area::DB, 7, 10, S7TransportSize::Byte, 1000)
        .await
        .unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[tokio::test]
async fn in_flight_jobs_never_exceed_the_granted_window() {
    init_tracing();
    let plc = MockPlc::start(MockOptions {
        grant_amq: 2,
        reply_delay: Duration::from_millis(150),
        ..Default::default()
    })
    .await;
    let client = S7Client::new(client_config(&plc)).unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.context().unwrap().window(), 2);

    let reads = (0..5u32).map(|i| client.read(S7Area::DB, 1, i * 4, S7TransportSize::Byte, 4));
    for result in join_all(reads).await {
        assert_eq!(result.unwrap().len(), 4);
    }
    assert_eq!(plc.stats.read_pdus.load(Ordering::SeqCst), 5);
    assert_eq!(plc.stats.max_inflight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disconnect_fails_every_pending_job() {
    init_tracing();
    let plc = MockPlc::start(MockOptions {
        reply_delay: Duration::from_secs(10),
        ..Default::default()
    })
    .await;
    let mut config = client_config(&plc);
    config.request_timeout_ms = 30_000;
    let client = Arc::new(S7Client::new(config).unwrap());
    client.connect().await.unwrap();

    let jobs: Vec<_> = (0..3u32)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .read(S7Area::DB, 1, i, S7TransportSize::Byte, 1)
                    .await
            })
        })
        .collect();
    common::eventually("three jobs at the PLC", || {
        plc.stats.inflight.load(Ordering::SeqCst) == 3
    })
    .await;

    client.disconnect().await.unwrap();
    for job in jobs {
        let result = timeout(Duration::from_secs(1), job).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::ErrNotConnected)));
    }
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn stray_reply_is_discarded_and_reported() {
    init_tracing();
    let plc = MockPlc::start(MockOptions {
        misroute: true,
        ..Default::default()
    })
    .await;
    plc.fill_db(3, &[9, 8, 7, 6]);
    let client = S7Client::new(client_config(&plc)).unwrap();
    let mut events = client.subscribe_events();
    client.connect().await.unwrap();

    let data = client
        .read(S7Area::DB, 3, 0, S7TransportSize::Byte, 4)
        .await
        .unwrap();
    assert_eq!(&data[..], &[9, 8, 7, 6]);

    let mut misses = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::CorrelationMiss { .. }) {
            misses += 1;
        }
    }
    assert_eq!(misses, 1);
}

#[tokio::test]
async fn unanswered_job_times_out_without_affecting_the_next() {
    init_tracing();
    let plc = MockPlc::start(MockOptions {
        swallow_reads: 1,
        ..Default::default()
    })
    .await;
    let mut config = client_config(&plc);
    config.request_timeout_ms = 300;
    let client = S7Client::new(config).unwrap();
    client.connect().await.unwrap();

    let first = client
        .read(S7Area::DB, 1, 0, S7TransportSize::Byte, 2)
        .await;
    assert!(matches!(first, Err(Error::ErrRequestTimeout)));
    let second = client
        .read(S7Area::DB, 1, 0, S7TransportSize::Byte, 2)
        .await
        .unwrap();
    assert_eq!(&second[..], &[0, 0]);
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn queued_jobs_time_out_from_submission() {
    init_tracing();
    let plc = MockPlc::start(MockOptions {
        grant_amq: 1,
        swallow_reads: 3,
        ..Default::default()
    })
    .await;
    let mut config = client_config(&plc);
    config.request_timeout_ms = 300;
    let client = S7Client::new(config).unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.context().unwrap().window(), 1);

    let started = Instant::now();
    let reads = (0..3u32).map(|i| {
        let client = &client;
        async move {
            let res = client
                .read(S7Area::DB, 1, i * 2, S7TransportSize::Byte, 2)
                .await;
            (res, started.elapsed())
        }
    });
    for (res, elapsed) in join_all(reads).await {
        assert!(matches!(res, Err(Error::ErrRequestTimeout)), "{res:?}");
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    }
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn failed_batch_fails_the_read_and_drains_the_others() {
    init_tracing();
    let plc = MockPlc::start(MockOptions {
        swallow_read_at: Some(462),
        ..Default::default()
    })
    .await;
    let data = pattern(1000);
    plc.fill_db(250, &data);
    let mut config = client_config(&plc);
    config.request_timeout_ms = 300;
    let client = S7Client::new(config).unwrap();
    let mut events = client.subscribe_events();
    client.connect().await.unwrap();

    let first = client
        .read(S7Area::DB, 250, 0, S7TransportSize::Byte, 1000)
        .await;
    assert!(matches!(first, Err(Error::ErrRequestTimeout)), "{first:?}");
    assert_eq!(plc.stats.read_pdus.load(Ordering::SeqCst), 3);

    let (mut misses, mut timeouts) = (0, 0);
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::CorrelationMiss { .. } => misses += 1,
            SessionEvent::RequestTimeout { .. } => timeouts += 1,
            _ => {}
        }
    }
    assert_eq!(misses, 0);
    assert_eq!(timeouts, 1);

    let back = client
        .read(S7Area::DB, 250, 0, S7TransportSize::Byte, 1000)
        .await
        .unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[tokio::test]
async fn item_failures_are_reported_per_item() {
    init_tracing();
    let plc = MockPlc::start(MockOptions::default()).await;
    plc.fill_db(1, &[1, 2, 3, 4]);
    let client = S7Client::new(client_config(&plc)).unwrap();
    client.connect().await.unwrap();

    let results = client
        .read_multi(&[
            S7VarSpec::new(S7Area::DB, 1, 0, S7TransportSize::Byte, 3),
            S7VarSpec::new(S7Area::M, 0, 0, S7TransportSize::Byte, 2),
            S7VarSpec::new(S7Area::DB, 1, 2, S7TransportSize::Word, 1),
        ])
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].return_code, S7ReturnCode::Success);
    assert_eq!(&results[0].data[..], &[1, 2, 3]);
    assert_eq!(results[1].return_code, S7ReturnCode::AddressOutOfRange);
    assert!(results[1].data.is_empty());
    assert_eq!(&results[2].data[..], &[3, 4]);

    let codes = client
        .write_multi(&[
            WriteItem::bytes(S7Area::DB, 2, 0, Bytes::from_static(&[0xAA])),
            WriteItem::bytes(S7Area::M, 0, 0, Bytes::from_static(&[0xBB])),
        ])
        .await
        .unwrap();
    assert_eq!(
        codes,
        vec![S7ReturnCode::Success, S7ReturnCode::AccessDenied]
    );
    assert!(matches!(
        client.read(S7Area::M, 0, 0, S7TransportSize::Byte, 1).await,
        Err(Error::ItemRejected {
            code: S7ReturnCode::AddressOutOfRange
        })
    ));
}

#[tokio::test]
async fn bits_are_read_and_written_individually() {
    init_tracing();
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = S7Client::new(client_config(&plc)).unwrap();
    client.connect().await.unwrap();

    client.write_bit(S7Area::DB, 5, 0, 3, true).await.unwrap();
    assert_eq!(plc.db(5), vec![1]);
    assert!(client.read_bit(S7Area::DB, 5, 0, 3).await.unwrap());
}

#[tokio::test]
async fn user_data_services() {
    init_tracing();
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = S7Client::new(client_config(&plc)).unwrap();
    client.connect().await.unwrap();

    let info = client.read_block_info(BlockType::DB, 250).await.unwrap();
    assert_eq!(info.number, 250);
    assert_eq!(info.mc7_size, 1000);
    assert_eq!(&info.author[..4], b"MOCK");

    // two data units, joined via continuation
    let before = plc.stats.user_data_pdus.load(Ordering::SeqCst);
    let alarms = client.read_pending_alarms().await.unwrap();
    assert_eq!(plc.stats.user_data_pdus.load(Ordering::SeqCst) - before, 2);
    assert_eq!(alarms.len(), 2);
    assert_eq!(alarms[0].event_id, 0x0001_0002);
    assert_eq!(alarms[1].event_id, 0x0003_0004);
    assert_eq!(&alarms[1].coming.values[0].data[..], &[0xAB, 0xCD]);

    let clock = client.read_clock().await.unwrap();
    assert_eq!(clock.to_string(), "2024-03-15 10:20:30.123");
}

#[tokio::test]
async fn oversized_write_is_rejected_locally() {
    init_tracing();
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = S7Client::new(client_config(&plc)).unwrap();
    client.connect().await.unwrap();

    let item = WriteItem {
        spec: S7VarSpec::new(S7Area::DB, 1, 0, S7TransportSize::Byte, 4),
        data: Bytes::from_static(&[1, 2]),
    };
    assert!(matches!(
        client.write_multi(&[item]).await,
        Err(Error::ErrInvalidParam)
    ));
    assert_eq!(plc.stats.write_pdus.load(Ordering::SeqCst), 0);
}
