use rplget::config::{
    parse_pps, Address, MacAddr, OutputFormat, PacketType, RunConfig, RunOption,
    PTP_PRIMARY_MCAST_MACADDR,
};
use rplget::flags::FlagSet;
use rplget::{Error, Mode};
use std::time::Duration;

fn config_err(config: RunConfig) -> String {
    match config.validate() {
        Err(Error::Config(msg)) => msg,
        other => panic!("expected a configuration error, got {:?}", other),
    }
}

#[test]
fn test_packet_count_rules() {
    let msg = config_err(RunConfig::receive_latency(PacketType::Udp).with_port(9000));
    assert!(msg.contains("packet num"));

    let msg = config_err(
        RunConfig::receive_latency(PacketType::Udp)
            .with_port(9000)
            .with_packet_count(0),
    );
    assert!(msg.contains("not 0"));

    // packet generation may run until interrupted
    let config = RunConfig::generate(PacketType::PtpL4).validate().unwrap();
    assert_eq!(config.packet_count, None);
}

#[test]
fn test_receive_modes_reject_sender_settings() {
    let msg = config_err(
        RunConfig::receive_latency(PacketType::Udp)
            .with_port(9000)
            .with_packet_count(10)
            .with_interval(Duration::from_millis(1)),
    );
    assert!(msg.contains("pps"));

    let msg = config_err(
        RunConfig::receive_rate(PacketType::Udp)
            .with_port(9000)
            .with_packet_count(10)
            .with_priority(3),
    );
    assert!(msg.contains("priority"));

    let msg = config_err(
        RunConfig::echo_latency(PacketType::PtpL4)
            .with_packet_count(10)
            .with_frame_size(128),
    );
    assert!(msg.contains("packet size"));
}

#[test]
fn test_udp_needs_port_and_address() {
    let msg = config_err(
        RunConfig::transmit_latency(PacketType::Udp)
            .with_address(Address::Ip("10.0.0.1".parse().unwrap()))
            .with_packet_count(1),
    );
    assert!(msg.contains("port"));

    let msg = config_err(
        RunConfig::round_trip(PacketType::Udp)
            .with_port(9000)
            .with_packet_count(1),
    );
    assert!(msg.contains("address"));

    // receivers listen on the port alone
    RunConfig::receive_latency(PacketType::Udp)
        .with_port(9000)
        .with_packet_count(1)
        .validate()
        .unwrap();
}

#[test]
fn test_link_layer_defaults() {
    let config = RunConfig::transmit_latency(PacketType::PtpL2)
        .with_interface("eth0")
        .with_port(319)
        .with_packet_count(10)
        .validate()
        .unwrap();
    assert_eq!(config.address, Some(Address::Mac(PTP_PRIMARY_MCAST_MACADDR)));
    // ports mean nothing below IP
    assert_eq!(config.port, None);

    // receivers keep the interface address
    let config = RunConfig::receive_latency(PacketType::RawPtpL2)
        .with_interface("eth0")
        .with_packet_count(10)
        .validate()
        .unwrap();
    assert_eq!(config.address, None);

    let msg = config_err(RunConfig::transmit_latency(PacketType::RawPtpL2).with_packet_count(1));
    assert!(msg.contains("dev has to be specified"));
}

#[test]
fn test_xdp_restrictions() {
    let msg = config_err(
        RunConfig::receive_rate(PacketType::XdpPtpL2)
            .with_interface("eth0")
            .with_packet_count(10),
    );
    assert!(msg.contains("af_xdp"));

    let msg = config_err(
        RunConfig::echo_latency(PacketType::XdpPtpL2)
            .with_interface("eth0")
            .with_port(319)
            .with_packet_count(10),
    );
    assert!(msg.contains("UDP port"));

    let config = RunConfig::echo_latency(PacketType::XdpPtpL2)
        .with_interface("eth0")
        .with_packet_count(10)
        .validate()
        .unwrap();
    assert_eq!(config.queue, Some(0));
}

#[test]
fn test_address_family_must_match() {
    let mac: MacAddr = "01:1b:19:00:00:00".parse().unwrap();
    let msg = config_err(
        RunConfig::transmit_latency(PacketType::Udp)
            .with_port(9000)
            .with_address(Address::Mac(mac))
            .with_packet_count(1),
    );
    assert!(msg.contains("does not match"));

    assert!(Address::parse_for(PacketType::PtpL2, "10.0.0.1").is_err());
    assert_eq!(
        Address::parse_for(PacketType::PtpL2, "01:1b:19:00:00:00").unwrap(),
        Address::Mac(mac)
    );
}

#[test]
fn test_format_defaults_per_mode() {
    let config = RunConfig::transmit_latency(PacketType::PtpL4)
        .with_packet_count(1)
        .validate()
        .unwrap();
    assert!(config.has_format(OutputFormat::Lat));
    assert_eq!(config.dev_deep, 0);

    let config = RunConfig::transmit_latency(PacketType::PtpL4)
        .with_packet_count(1)
        .with_format(OutputFormat::Sched)
        .validate()
        .unwrap();
    // scheduler hops come with the latency breakdown
    assert!(config.has_format(OutputFormat::Lat));
    assert_eq!(config.dev_deep, 1);

    let formats = FlagSet::<OutputFormat>::parse_list("hwts,plain").unwrap();
    let config = RunConfig::receive_rate(PacketType::PtpL4)
        .with_packet_count(1)
        .with_formats(formats)
        .with_option(RunOption::Progress)
        .validate()
        .unwrap();
    assert!(!config.has_format(OutputFormat::Hwts));
    assert!(config.has_format(OutputFormat::Plain));
    assert!(!config.has_option(RunOption::Progress));
}

#[test]
fn test_frame_size_bounds() {
    let msg = config_err(
        RunConfig::transmit_latency(PacketType::PtpL4)
            .with_packet_count(1)
            .with_frame_size(40),
    );
    assert!(msg.contains("below"));

    assert!(RunConfig::transmit_latency(PacketType::PtpL4)
        .with_packet_count(1)
        .with_frame_size(9000)
        .validate()
        .is_err());
}

#[test]
fn test_cli_value_parsing() {
    assert_eq!("rtt".parse::<Mode>().unwrap(), Mode::RoundTrip);
    assert!("latency".parse::<Mode>().is_err());
    assert_eq!(
        "xdp_ptpl2".parse::<PacketType>().unwrap(),
        PacketType::XdpPtpL2
    );
    assert_eq!(parse_pps("4").unwrap(), Duration::from_millis(250));
    assert!(parse_pps("0").is_err());
    assert!(FlagSet::<RunOption>::parse_list("progress,bogus").is_err());
}
