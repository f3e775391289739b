//! Outgoing header block compression
//!
//! The hpack encoder keeps a dynamic table of the default 4096 octets and
//! cannot be resized. Once the peer announces a smaller
//! SETTINGS_HEADER_TABLE_SIZE, [`HeaderEncoder`] signals the new size at the
//! start of the next block and from then on emits every field as a literal
//! without indexing (RFC 7541 Section 6.2.2), which never touches the
//! dynamic table.

use super::DEFAULT_HEADER_TABLE_SIZE;

/// Header block encoder honouring the peer's dynamic table size
pub struct HeaderEncoder {
    indexed: hpack::Encoder<'static>,
    /// Literal-only mode, entered once the peer shrinks its table
    literal: bool,
    /// Dynamic table size update owed at the start of the next block
    pending_size_update: Option<u32>,
}

impl HeaderEncoder {
    pub fn new() -> Self {
        HeaderEncoder {
            indexed: hpack::Encoder::new(),
            literal: false,
            pending_size_update: None,
        }
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE
    pub fn set_max_table_size(&mut self, size: u32) {
        if size >= DEFAULT_HEADER_TABLE_SIZE && !self.literal {
            return;
        }
        self.literal = true;
        // Entries the peer may still hold are never referenced again, so the
        // signalled size only has to respect the new limit.
        let size = size.min(DEFAULT_HEADER_TABLE_SIZE);
        self.pending_size_update = Some(match self.pending_size_update {
            Some(pending) => pending.min(size),
            None => size,
        });
    }

    /// True once fields are sent without indexing
    pub fn is_literal(&self) -> bool {
        self.literal
    }

    pub fn encode(&mut self, fields: &[(String, String)], dst: &mut Vec<u8>) -> std::io::Result<()> {
        if !self.literal {
            let header_tuples: Vec<(&[u8], &[u8])> = fields
                .iter()
                .map(|(name, value)| (name.as_bytes(), value.as_bytes()))
                .collect();
            return self.indexed.encode_into(header_tuples, dst);
        }
        if let Some(size) = self.pending_size_update.take() {
            encode_integer(size as usize, 5, 0x20, dst);
        }
        for (name, value) in fields {
            // Literal without indexing, new name
            dst.push(0x00);
            encode_string(name.as_bytes(), dst);
            encode_string(value.as_bytes(), dst);
        }
        Ok(())
    }
}

impl Default for HeaderEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefixed integer (RFC 7541 Section 5.1)
fn encode_integer(mut value: usize, prefix_bits: u8, flags: u8, dst: &mut Vec<u8>) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        dst.push(flags | value as u8);
        return;
    }
    dst.push(flags | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        dst.push((value % 128) as u8 | 0x80);
        value /= 128;
    }
    dst.push(value as u8);
}

/// String literal without Huffman coding
fn encode_string(value: &[u8], dst: &mut Vec<u8>) {
    encode_integer(value.len(), 7, 0x00, dst);
    dst.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    fn decode(decoder: &mut hpack::Decoder<'static>, block: &[u8]) -> Vec<(String, String)> {
        decoder
            .decode(block)
            .unwrap()
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8(name).unwrap(),
                    String::from_utf8(value).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_encode_integer() {
        let mut buf = Vec::new();
        encode_integer(10, 5, 0x00, &mut buf);
        assert_eq!(buf, [0x0a]);

        buf.clear();
        encode_integer(1337, 5, 0x00, &mut buf);
        assert_eq!(buf, [0x1f, 0x9a, 0x0a]);

        buf.clear();
        encode_integer(127, 7, 0x00, &mut buf);
        assert_eq!(buf, [0x7f, 0x00]);
    }

    #[test]
    fn test_default_table_keeps_indexing() {
        let mut encoder = HeaderEncoder::new();
        encoder.set_max_table_size(8192);
        assert!(!encoder.is_literal());

        let request = fields(&[(":method", "GET"), (":path", "/")]);
        let mut block = Vec::new();
        encoder.encode(&request, &mut block).unwrap();
        // Both fields are in the static table
        assert_eq!(block, [0x82, 0x84]);
    }

    #[test]
    fn test_zero_table_size_sends_literals() {
        let mut encoder = HeaderEncoder::new();
        let mut decoder = hpack::Decoder::new();
        let request = fields(&[(":method", "GET"), (":path", "/index.html"), ("x-trace", "abc")]);

        let mut block = Vec::new();
        encoder.encode(&request, &mut block).unwrap();
        assert_eq!(decode(&mut decoder, &block), request);

        encoder.set_max_table_size(0);
        assert!(encoder.is_literal());
        let mut block = Vec::new();
        encoder.encode(&request, &mut block).unwrap();
        // Size update to zero, then a literal without indexing
        assert_eq!(&block[..2], &[0x20, 0x00]);
        assert_eq!(decode(&mut decoder, &block), request);

        let mut block = Vec::new();
        encoder.encode(&request, &mut block).unwrap();
        assert_eq!(block[0], 0x00);
        assert_eq!(decode(&mut decoder, &block), request);
    }

    #[test]
    fn test_size_update_signalled_once() {
        let mut encoder = HeaderEncoder::new();
        encoder.set_max_table_size(1024);
        encoder.set_max_table_size(256);

        let mut block = Vec::new();
        encoder.encode(&fields(&[("a", "b")]), &mut block).unwrap();
        assert_eq!(block, [0x3f, 0xe1, 0x01, 0x00, 0x01, b'a', 0x01, b'b']);

        let mut block = Vec::new();
        encoder.encode(&fields(&[("a", "b")]), &mut block).unwrap();
        assert_eq!(block, [0x00, 0x01, b'a', 0x01, b'b']);
    }
}
