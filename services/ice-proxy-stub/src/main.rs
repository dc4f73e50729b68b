//! ice-proxy-stub binary: a CLI front end for `ice_proxy_stub::run`.

use clap::{Arg, Command};
use ice_proxy_stub::ProxyConfig;
use tracing::info;

fn validate_addr(value: &str) -> Result<std::net::SocketAddr, String> {
    value.parse().map_err(|_| "invalid socket address".to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("ice-proxy-stub")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A canned ICE proxy for exercising the control-plane signaling protocol")
        .arg(
            Arg::new("server")
                .help("Control-plane socket address to register against")
                .short('s')
                .long("server")
                .value_parser(validate_addr)
                .default_value("127.0.0.1:9000"),
        )
        .arg(
            Arg::new("uuid")
                .help("Identifier this proxy registers under")
                .short('u')
                .long("uuid")
                .default_value("ice-proxy-stub"),
        )
        .arg(
            Arg::new("ssrc")
                .help("SSRC reported in every session_create response")
                .long("ssrc")
                .value_parser(clap::value_parser!(u32))
                .default_value("1"),
        )
        .arg(
            Arg::new("forward_host")
                .help("Forwarding host reported in every session_create response")
                .long("forward-host")
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::new("forward_port")
                .help("Forwarding port reported in every session_create response")
                .long("forward-port")
                .value_parser(clap::value_parser!(u16))
                .default_value("12000"),
        )
        .arg(
            Arg::new("forward_transport")
                .help("Forwarding transport reported in every session_create response")
                .long("forward-transport")
                .default_value("udp"),
        )
        .arg(
            Arg::new("sdp_answer")
                .help("SDP answer body reported in every session_create response")
                .long("sdp")
                .default_value("v=0"),
        )
        .get_matches();

    let config = ProxyConfig {
        server_addr: *matches.get_one::<std::net::SocketAddr>("server").expect("server has a default"),
        uuid: matches.get_one::<String>("uuid").expect("uuid has a default").clone(),
        ssrc: *matches.get_one::<u32>("ssrc").expect("ssrc has a default"),
        forward_host: matches.get_one::<String>("forward_host").expect("forward_host has a default").clone(),
        forward_port: *matches.get_one::<u16>("forward_port").expect("forward_port has a default"),
        forward_transport: matches.get_one::<String>("forward_transport").expect("forward_transport has a default").clone(),
        sdp_answer: matches.get_one::<String>("sdp_answer").expect("sdp_answer has a default").clone(),
    };

    info!(addr = %config.server_addr, uuid = %config.uuid, "ice-proxy-stub starting");
    ice_proxy_stub::run(config).await;
}
