//! Codec invariants for the value tree: binary and JSON round trips over
//! seeded random trees, plus packet framing over the same payloads.

use ailoy::{generate_uuid, Dtype, NdArray, Packet, Value, ValueMap};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Random value tree in JSON-canonical form (Uint for non-negative ints,
/// Double for floats) so both encodings round-trip exactly.
fn random_value(rng: &mut StdRng, depth: usize) -> Value {
    let pick = if depth == 0 {
        rng.gen_range(0..7)
    } else {
        rng.gen_range(0..9)
    };
    match pick {
        0 => Value::Null,
        1 => Value::Bool(rng.gen()),
        2 => Value::Int(-(rng.gen_range(1..1_000_000i64))),
        3 => Value::Uint(rng.gen()),
        4 => Value::Double(f64::from_bits(0x3FF0_0000_0000_0000 | rng.gen::<u64>() >> 12)),
        5 => {
            let len = rng.gen_range(0..24);
            Value::Str((0..len).map(|_| rng.gen_range('a'..='z')).collect())
        }
        6 => {
            let len = rng.gen_range(0..32);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            Value::Bytes(Bytes::from(data))
        }
        7 => {
            let len = rng.gen_range(0..5);
            Value::Array((0..len).map(|_| random_value(rng, depth - 1)).collect())
        }
        _ => {
            let len = rng.gen_range(0..5);
            let mut map = ValueMap::new();
            for index in 0..len {
                map.insert(format!("k{index}"), random_value(rng, depth - 1));
            }
            Value::Map(map)
        }
    }
}

#[test]
fn binary_round_trip_over_random_trees() {
    let mut rng = StdRng::seed_from_u64(0xA110);
    for _ in 0..200 {
        let value = random_value(&mut rng, 3);
        let encoded = value.encode_binary().expect("encode");
        let decoded = Value::decode_binary(&encoded).expect("decode");
        assert_eq!(value, decoded);
    }
}

#[test]
fn json_round_trip_over_random_trees() {
    let mut rng = StdRng::seed_from_u64(0x1A07);
    for _ in 0..200 {
        let value = random_value(&mut rng, 3);
        let text = value.to_json_string().expect("encode");
        let decoded = Value::from_json_str(&text).expect("decode");
        assert_eq!(value, decoded);
    }
}

#[test]
fn binary_round_trip_distinguishes_every_numeric_variant() {
    for value in [
        Value::Int(0),
        Value::Int(i64::MIN),
        Value::Int(i64::MAX),
        Value::Uint(0),
        Value::Uint(u64::MAX),
        Value::Float(f32::MAX),
        Value::Float(-0.0),
        Value::Double(f64::MIN_POSITIVE),
        Value::Double(-0.0),
    ] {
        let back = Value::decode_binary(&value.encode_binary().expect("encode")).expect("decode");
        assert_eq!(back.kind(), value.kind());
        assert_eq!(back, value);
    }
}

#[test]
fn ndarray_survives_both_encodings() {
    let tensor = Value::NdArray(
        NdArray::new(
            vec![2, 3],
            Dtype::I32,
            Bytes::from((0..24u8).collect::<Vec<u8>>()),
        )
        .expect("geometry"),
    );
    let binary = Value::decode_binary(&tensor.encode_binary().expect("encode")).expect("decode");
    assert_eq!(binary, tensor);
    let json = Value::from_json_str(&tensor.to_json_string().expect("encode")).expect("decode");
    assert_eq!(json, tensor);
}

#[test]
fn packet_round_trip_over_random_payloads() {
    let mut rng = StdRng::seed_from_u64(0x9ACE);
    for _ in 0..100 {
        let body = random_value(&mut rng, 2);
        let packet = Packet::execute_method(&generate_uuid(), "comp", "run", body);
        let frame = packet.encode().expect("encode");
        assert_eq!(Packet::decode(&frame).expect("decode"), packet);

        let stream = Packet::respond_execute(
            &generate_uuid(),
            rng.gen(),
            rng.gen(),
            random_value(&mut rng, 2),
        );
        let frame = stream.encode().expect("encode");
        assert_eq!(Packet::decode(&frame).expect("decode"), stream);
    }
}
