use s7_client::{ClientConfig, CpuType, S7Client, Tsap, TsapConfig};

#[test]
fn empty_object_yields_defaults() {
    let config: ClientConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, ClientConfig::default());
    assert_eq!(config.port, 102);
    assert_eq!(config.pdu_size, 960);
    assert!(config.auto_reconnect);
    assert_eq!(config.tsap, TsapConfig::RackSlot { rack: 0, slot: 2 });
}

#[test]
fn camel_case_fields_and_explicit_tsap() {
    let json = r#"{
        "host": "10.0.0.5",
        "tsap": { "kind": "tsap", "local": 256, "remote": 768 },
        "pduSize": 480,
        "maxAmqCalling": 3,
        "autoReconnect": false,
        "reconnectIntervalMs": 500,
        "recvBufferSize": 65536
    }"#;
    let config: ClientConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.host, "10.0.0.5");
    assert_eq!(config.pdu_size, 480);
    assert_eq!(config.max_amq_calling, 3);
    assert_eq!(config.max_amq_called, 8);
    assert!(!config.auto_reconnect);
    assert_eq!(config.recv_buffer_size, Some(65536));
    let pair = config.tsap_pair().unwrap();
    assert_eq!((pair.local, pair.remote), (Tsap(0x0100), Tsap(0x0300)));
    assert!(S7Client::new(config).is_ok());
}

#[test]
fn rack_slot_tsap_follows_cpu_family() {
    let json = r#"{ "cpu": 5, "connectionType": 3, "tsap": { "kind": "rackSlot", "rack": 1, "slot": 3 } }"#;
    let config: ClientConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.cpu, CpuType::S71500);
    assert_eq!(config.tsap_pair().unwrap().remote, Tsap(0x0323));

    let round: ClientConfig =
        serde_json::from_value(serde_json::to_value(&config).unwrap()).unwrap();
    assert_eq!(round, config);
}

#[test]
fn invalid_configuration_is_rejected_on_construction() {
    let config: ClientConfig = serde_json::from_str(r#"{ "tpduSize": 1000 }"#).unwrap();
    assert!(config.validate().is_err());
    assert!(S7Client::new(config).is_err());
}
