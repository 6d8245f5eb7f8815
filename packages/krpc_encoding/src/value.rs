use crate::errors::{ErrorKind, Result};
use std::collections::BTreeMap;

/// A bencode value.
///
/// The wire format only knows integers, byte strings, lists and
/// dictionaries. The extra variants exist on the API side: booleans encode
/// as `i1e`/`i0e`, [`Value::Text`] collapses to a plain byte string, and
/// [`Value::Preencoded`] splices an already-encoded blob into the output
/// without re-encoding it. The decoder only ever produces the four wire
/// variants, so binary payloads (ids, tokens, compact node blobs) stay raw
/// bytes.
///
/// Dictionary keys are kept as raw bytes and ordered by
/// [`BTreeMap`], which makes every encoded dictionary canonical
/// (lexicographically ascending keys) by construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Value {
    Integer(i64),
    Boolean(bool),
    Bytes(Vec<u8>),
    Text(String),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
    Preencoded(Vec<u8>),
}

impl Value {
    /// Encodes the value into its canonical bencode form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Integer(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Boolean(b) => {
                out.extend_from_slice(if *b { b"i1e" } else { b"i0e" });
            }
            Value::Bytes(bytes) => encode_bytes(bytes, out),
            Value::Text(text) => encode_bytes(text.as_bytes(), out),
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    encode_bytes(key, out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Preencoded(raw) => out.extend_from_slice(raw),
        }
    }

    /// Decodes a complete bencode value.
    ///
    /// Fails on trailing input, leading-zero or `-0` integers, malformed
    /// length descriptors, unknown prefix tokens, lengths overrunning the
    /// input, and duplicate dictionary keys. Out-of-order dictionary keys
    /// are accepted; they re-sort on the way in, so `encode(decode(x)) == x`
    /// holds for canonically encoded inputs only.
    pub fn decode(input: &[u8]) -> Result<Value> {
        let mut decoder = Decoder { input, pos: 0 };
        let value = decoder.parse_value()?;
        let remaining = input.len() - decoder.pos;
        if remaining > 0 {
            return Err(ErrorKind::TrailingBytes { count: remaining }.into());
        }
        Ok(value)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            Value::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Dictionary lookup by raw key bytes.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|entries| entries.get(key))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Integer(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Value {
        Value::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Value {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Value {
        Value::Bytes(bytes.to_vec())
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn parse_value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => self.parse_integer(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_string()?.to_vec())),
            prefix => Err(ErrorKind::UnknownPrefix {
                prefix,
                offset: self.pos,
            }
            .into()),
        }
    }

    fn parse_integer(&mut self) -> Result<Value> {
        let start = self.pos;
        self.pos += 1;
        let digits_start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.input[digits_start..self.pos];
        self.pos += 1;

        let invalid = || ErrorKind::InvalidInteger { offset: start };
        let unsigned = match digits.split_first() {
            Some((&b'-', rest)) => {
                // "-0" and "-0…" are not valid encodings of anything.
                if rest.first() == Some(&b'0') {
                    return Err(invalid().into());
                }
                rest
            }
            _ => digits,
        };
        if unsigned.is_empty() || (unsigned[0] == b'0' && unsigned.len() > 1) {
            return Err(invalid().into());
        }
        if !unsigned.iter().all(u8::is_ascii_digit) {
            return Err(invalid().into());
        }

        let text = std::str::from_utf8(digits).map_err(|_| invalid())?;
        let n = text.parse::<i64>().map_err(|_| invalid())?;
        Ok(Value::Integer(n))
    }

    fn parse_string(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        let digits_start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }
        let digits = &self.input[digits_start..self.pos];
        self.pos += 1;

        let invalid = || ErrorKind::InvalidLengthDescriptor { offset: start };
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(invalid().into());
        }
        if digits[0] == b'0' && digits.len() > 1 {
            return Err(invalid().into());
        }
        let len = std::str::from_utf8(digits)
            .map_err(|_| invalid())?
            .parse::<usize>()
            .map_err(|_| invalid())?;

        if self.input.len() - self.pos < len {
            return Err(ErrorKind::UnexpectedEnd.into());
        }
        let bytes = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Value> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn parse_dict(&mut self) -> Result<Value> {
        self.pos += 1;
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            let key_offset = self.pos;
            match self.peek()? {
                b'0'..=b'9' => {}
                prefix => {
                    return Err(ErrorKind::UnknownPrefix {
                        prefix,
                        offset: key_offset,
                    }
                    .into())
                }
            }
            let key = self.parse_string()?.to_vec();
            let value = self.parse_value()?;
            if entries.insert(key.clone(), value).is_some() {
                return Err(ErrorKind::DuplicateKey {
                    key: String::from_utf8_lossy(&key).into_owned(),
                }
                .into());
            }
        }
        self.pos += 1;
        Ok(Value::Dict(entries))
    }

    fn peek(&self) -> Result<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or_else(|| ErrorKind::UnexpectedEnd.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded(input: &[u8]) -> Value {
        Value::decode(input).unwrap()
    }

    fn kind_of(input: &[u8]) -> ErrorKind {
        Value::decode(input).unwrap_err().kind().clone()
    }

    #[test]
    fn integer_round_trip() {
        for n in &[0i64, 1, -1, 42, -42, i64::MAX, i64::MIN] {
            let encoded = Value::Integer(*n).encode();
            assert_eq!(decoded(&encoded), Value::Integer(*n));
        }
        assert_eq!(Value::Integer(0).encode(), b"i0e");
        assert_eq!(Value::Integer(-7).encode(), b"i-7e");
    }

    #[test]
    fn string_round_trip() {
        assert_eq!(Value::Bytes(vec![]).encode(), b"0:");
        let blob = Value::Bytes(vec![0x00, 0xff, 0x7f]);
        assert_eq!(decoded(&blob.encode()), blob);
    }

    #[test]
    fn text_encodes_as_plain_string() {
        assert_eq!(Value::from("spam").encode(), b"4:spam");
        // Decoding always yields raw bytes.
        assert_eq!(decoded(b"4:spam"), Value::Bytes(b"spam".to_vec()));
    }

    #[test]
    fn booleans_encode_as_integers() {
        assert_eq!(Value::Boolean(true).encode(), b"i1e");
        assert_eq!(Value::Boolean(false).encode(), b"i0e");
        assert_eq!(decoded(b"i1e"), Value::Integer(1));
    }

    #[test]
    fn preencoded_is_spliced_verbatim() {
        let inner = Value::List(vec![Value::Integer(1), Value::Integer(2)]).encode();
        let mut entries = BTreeMap::new();
        entries.insert(b"x".to_vec(), Value::Preencoded(inner.clone()));
        assert_eq!(Value::Dict(entries).encode(), b"d1:xli1ei2eee");
        assert_eq!(decoded(&Value::Preencoded(inner.clone()).encode()), decoded(&inner));
    }

    #[test]
    fn nested_dict_matches_reference_encoding() {
        let mut entries = BTreeMap::new();
        entries.insert(b"a".to_vec(), Value::from("b"));
        entries.insert(b"cd".to_vec(), Value::Integer(42));
        entries.insert(
            b"l".to_vec(),
            Value::List(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]),
        );
        assert_eq!(Value::Dict(entries).encode(), &b"d1:a1:b2:cdi42e1:lli1ei2ei3eee"[..]);
    }

    #[test]
    fn dict_keys_encode_in_ascending_byte_order() {
        let keys: [&[u8]; 5] = [b"zz", b"a", b"ab", b"\xff", b"b"];
        let mut entries = BTreeMap::new();
        for key in &keys {
            entries.insert(key.to_vec(), Value::Integer(1));
        }
        let encoded = Value::Dict(entries).encode();
        assert_eq!(&encoded[..], &b"d1:ai1e2:abi1e1:bi1e2:zzi1e1:\xffi1ee"[..]);
    }

    #[test]
    fn canonical_inputs_re_encode_byte_identically() {
        let canonical: &[&[u8]] = &[
            b"i0e",
            b"i-12e",
            b"0:",
            b"4:spam",
            b"le",
            b"de",
            b"li1e4:spamdee",
            b"d1:a1:b2:cdi42e1:lli1ei2ei3eee",
        ];
        for input in canonical {
            assert_eq!(&decoded(input).encode()[..], *input);
        }
    }

    #[test]
    fn rejects_negative_zero() {
        assert_eq!(kind_of(b"i-0e"), ErrorKind::InvalidInteger { offset: 0 });
    }

    #[test]
    fn rejects_leading_zero_integer() {
        assert_eq!(kind_of(b"i03e"), ErrorKind::InvalidInteger { offset: 0 });
    }

    #[test]
    fn rejects_leading_zero_length_descriptor() {
        assert_eq!(
            kind_of(b"02:xy"),
            ErrorKind::InvalidLengthDescriptor { offset: 0 }
        );
    }

    #[test]
    fn rejects_duplicate_dict_keys() {
        assert_eq!(
            kind_of(b"d1:ai1e1:ai2ee"),
            ErrorKind::DuplicateKey {
                key: "a".to_string()
            }
        );
    }

    #[test]
    fn accepts_out_of_order_dict_keys() {
        let value = decoded(b"d1:bi1e1:ai2ee");
        assert_eq!(value.get(b"a"), Some(&Value::Integer(2)));
        assert_eq!(value.get(b"b"), Some(&Value::Integer(1)));
        // Re-encoding sorts, so the output differs from the tolerated input.
        assert_eq!(value.encode(), b"d1:ai2e1:bi1ee");
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert_eq!(kind_of(b"i1ex"), ErrorKind::TrailingBytes { count: 1 });
    }

    #[test]
    fn rejects_unterminated_values() {
        assert_eq!(kind_of(b"l"), ErrorKind::UnexpectedEnd);
        assert_eq!(kind_of(b"d"), ErrorKind::UnexpectedEnd);
        assert_eq!(kind_of(b"li1e"), ErrorKind::UnexpectedEnd);
        assert_eq!(kind_of(b"3:ab"), ErrorKind::UnexpectedEnd);
    }

    #[test]
    fn rejects_unknown_prefix() {
        assert_eq!(
            kind_of(b"x"),
            ErrorKind::UnknownPrefix {
                prefix: b'x',
                offset: 0
            }
        );
    }

    #[test]
    fn rejects_non_string_dict_key() {
        assert_eq!(
            kind_of(b"di1ei2ee"),
            ErrorKind::UnknownPrefix {
                prefix: b'i',
                offset: 1
            }
        );
    }
}
