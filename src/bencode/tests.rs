use std::collections::BTreeMap;

use bytes::Bytes;

use super::*;

#[test]
fn decode_integers() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn reject_bad_integers() {
    assert!(decode(b"i042e").is_err());
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i12").is_err());
}

#[test]
fn decode_byte_strings() {
    assert_eq!(decode(b"5:hello").unwrap(), Value::string("hello"));
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
    // length prefix running past the input
    assert!(decode(b"10:short").is_err());
}

#[test]
fn decode_nested() {
    let v = decode(b"d4:listli1ei2ee4:name5:tidale").unwrap();
    assert_eq!(v.get(b"name").and_then(Value::as_str), Some("tidal"));
    assert_eq!(v.get(b"list").and_then(Value::as_list).map(<[_]>::len), Some(2));
}

#[test]
fn reject_trailing_data() {
    assert!(decode(b"i1eXX").is_err());
    let (v, used) = decode_prefix(b"i1eXX").unwrap();
    assert_eq!(v, Value::Integer(1));
    assert_eq!(used, 3);
}

#[test]
fn reject_non_string_keys() {
    assert!(matches!(
        decode(b"di1ei2ee"),
        Err(BencodeError::NonStringKey)
    ));
}

#[test]
fn reject_runaway_nesting() {
    let mut data = vec![b'l'; 100];
    data.extend(std::iter::repeat_n(b'e', 100));
    assert!(matches!(
        decode(&data),
        Err(BencodeError::NestingTooDeep(_))
    ));
}

#[test]
fn round_trip() {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"zz"), Value::Integer(-3));
    dict.insert(Bytes::from_static(b"aa"), Value::string("first"));
    dict.insert(
        Bytes::from_static(b"mid"),
        Value::List(vec![Value::Integer(1), Value::string("x")]),
    );
    let value = Value::Dict(dict);

    let encoded = encode(&value);
    assert_eq!(decode(&encoded).unwrap(), value);
}

#[test]
fn dict_keys_encode_sorted() {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"b"), Value::Integer(2));
    dict.insert(Bytes::from_static(b"a"), Value::Integer(1));
    let encoded = encode(&Value::Dict(dict));
    assert_eq!(encoded, b"d1:ai1e1:bi2ee");
    // byte-stable on re-encode through a decode cycle
    assert_eq!(encode(&decode(&encoded).unwrap()), encoded);
}
