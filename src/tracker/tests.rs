use std::collections::BTreeMap;

use bytes::Bytes;

use super::http::url_encode;
use super::*;
use crate::bencode::Value;

#[test]
fn url_encode_reserved_bytes() {
    assert_eq!(url_encode(b"abc-_.~"), "abc-_.~");
    assert_eq!(url_encode(&[0x00, 0xff, b' ']), "%00%FF%20");
}

#[test]
fn parse_compact_peer_list() {
    let data = [127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x00, 0x50];
    let peers = parse_compact_peers(&data);
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
    assert_eq!(peers[1], "10.0.0.2:80".parse().unwrap());

    // trailing partial entries are ignored
    assert_eq!(parse_compact_peers(&data[..8]).len(), 1);
}

#[test]
fn parse_announce_response_compact() {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"interval"), Value::Integer(1800));
    dict.insert(
        Bytes::from_static(b"peers"),
        Value::Bytes(Bytes::from_static(&[127, 0, 0, 1, 0x1a, 0xe1])),
    );
    let resp = AnnounceResponse::from_value(&Value::Dict(dict)).unwrap();
    assert_eq!(resp.interval, 1800);
    assert_eq!(resp.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
}

#[test]
fn parse_announce_response_dict_form() {
    let mut peer = BTreeMap::new();
    peer.insert(Bytes::from_static(b"ip"), Value::string("127.0.0.1"));
    peer.insert(Bytes::from_static(b"port"), Value::Integer(8080));
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"interval"), Value::Integer(60));
    dict.insert(
        Bytes::from_static(b"peers"),
        Value::List(vec![Value::Dict(peer)]),
    );
    let resp = AnnounceResponse::from_value(&Value::Dict(dict)).unwrap();
    assert_eq!(resp.peers, vec!["127.0.0.1:8080".parse().unwrap()]);
}

#[test]
fn parse_announce_failure() {
    let mut dict = BTreeMap::new();
    dict.insert(
        Bytes::from_static(b"failure reason"),
        Value::string("unregistered torrent"),
    );
    assert!(matches!(
        AnnounceResponse::from_value(&Value::Dict(dict)),
        Err(TrackerError::Failure(_))
    ));
}

#[test]
fn parse_announce_missing_interval() {
    let dict = BTreeMap::new();
    assert!(AnnounceResponse::from_value(&Value::Dict(dict)).is_err());
}
