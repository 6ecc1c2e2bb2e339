use byteorder::{LittleEndian as LE, WriteBytesExt};

use super::*;

/// Where a written group lives: symbol-table entries of groups cache the
/// B-tree and heap addresses.
#[derive(Clone, Copy, Debug)]
struct GroupAddresses {
    header: u64,
    btree: u64,
    heap: u64,
}

struct SymbolEntry {
    name_offset: u64,
    header: u64,
    scratch: Option<(u64, u64)>,
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

fn dataspace(shape: &[usize]) -> PortResult<Vec<u8>> {
    let mut v = vec![1, shape.len() as u8, 0, 0, 0, 0, 0, 0];
    for &d in shape {
        v.write_u64::<LE>(d as u64)?;
    }
    Ok(v)
}

fn datatype(dt: DatumType) -> PortResult<Vec<u8>> {
    let mut v = vec![];
    match dt {
        DatumType::F32 => {
            // IEEE little-endian, implied leading mantissa bit, sign at bit 31
            v.extend([0x11, 0x20, 31, 0]);
            v.write_u32::<LE>(4)?;
            v.write_u16::<LE>(0)?;
            v.write_u16::<LE>(32)?;
            v.extend([23, 8, 0, 23]);
            v.write_u32::<LE>(127)?;
        }
        DatumType::I64 => {
            // signed little-endian
            v.extend([0x10, 0x08, 0, 0]);
            v.write_u32::<LE>(8)?;
            v.write_u16::<LE>(0)?;
            v.write_u16::<LE>(64)?;
        }
    }
    Ok(v)
}

/// Null-terminated UTF-8 string of `size` bytes, terminator included.
fn string_datatype(size: usize) -> PortResult<Vec<u8>> {
    let mut v = vec![0x13, 0x10, 0, 0];
    v.write_u32::<LE>(size as u32)?;
    Ok(v)
}

fn c_string(s: &str) -> PortResult<Vec<u8>> {
    ensure!(!s.contains('\0'), "Strings can not hold NUL characters: {s:?}");
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    Ok(bytes)
}

fn padded(v: &mut Vec<u8>, bytes: &[u8]) {
    v.extend_from_slice(bytes);
    v.resize(v.len() + pad8(bytes.len()) - bytes.len(), 0);
}

fn attribute(name: &str, value: &str) -> PortResult<Vec<u8>> {
    let name = c_string(name)?;
    let data = c_string(value)?;
    let dt = string_datatype(data.len())?;
    let ds = dataspace(&[])?;
    let mut v = vec![1, 0];
    v.write_u16::<LE>(name.len() as u16)?;
    v.write_u16::<LE>(dt.len() as u16)?;
    v.write_u16::<LE>(ds.len() as u16)?;
    padded(&mut v, &name);
    padded(&mut v, &dt);
    padded(&mut v, &ds);
    v.extend(data);
    Ok(v)
}

fn attributes(attrs: &BTreeMap<String, String>) -> PortResult<Vec<(u16, Vec<u8>)>> {
    attrs
        .iter()
        .map(|(k, v)| Ok((msg::ATTRIBUTE, attribute(k, v).with_context(|| format!("Encoding attribute {k}"))?)))
        .collect()
}

impl Writer {
    fn pos(&self) -> u64 {
        self.buf.len() as u64
    }

    fn pad_to(&mut self, end: u64) {
        self.buf.resize(end as usize, 0);
    }

    fn symbol_entry(&mut self, entry: &SymbolEntry) -> PortResult<()> {
        self.buf.write_u64::<LE>(entry.name_offset)?;
        self.buf.write_u64::<LE>(entry.header)?;
        self.buf.write_u32::<LE>(entry.scratch.is_some() as u32)?;
        self.buf.write_u32::<LE>(0)?;
        let (btree, heap) = entry.scratch.unwrap_or((0, 0));
        self.buf.write_u64::<LE>(btree)?;
        self.buf.write_u64::<LE>(heap)?;
        Ok(())
    }

    fn object_header(&mut self, messages: &[(u16, Vec<u8>)]) -> PortResult<u64> {
        let addr = self.pos();
        let size: usize = messages.iter().map(|(_, data)| 8 + pad8(data.len())).sum();
        self.buf.extend([1, 0]);
        self.buf.write_u16::<LE>(messages.len() as u16)?;
        self.buf.write_u32::<LE>(1)?;
        self.buf.write_u32::<LE>(size as u32)?;
        self.buf.write_u32::<LE>(0)?;
        for (kind, data) in messages {
            let len = pad8(data.len());
            ensure!(len <= u16::MAX as usize, "Header message of {len} bytes does not fit in an object header");
            self.buf.write_u16::<LE>(*kind)?;
            self.buf.write_u16::<LE>(len as u16)?;
            self.buf.extend([0, 0, 0, 0]);
            padded(&mut self.buf, data);
        }
        Ok(addr)
    }

    fn dataset(&mut self, dataset: &Dataset) -> PortResult<u64> {
        let (dtype, shape, bytes): (Vec<u8>, TVec<usize>, Vec<u8>) = match &dataset.value {
            Value::Tensor(t) => (datatype(t.datum_type())?, t.shape().into(), t.to_le_bytes()?),
            Value::String(s) => {
                let bytes = c_string(s)?;
                (string_datatype(bytes.len())?, tvec!(), bytes)
            }
        };
        let address = if bytes.is_empty() {
            UNDEFINED_ADDRESS
        } else {
            let addr = self.pos();
            self.buf.extend(&bytes);
            addr
        };
        let mut layout = vec![3, 1];
        layout.write_u64::<LE>(address)?;
        layout.write_u64::<LE>(bytes.len() as u64)?;

        let mut messages = vec![(msg::DATASPACE, dataspace(&shape)?), (msg::DATATYPE, dtype), (msg::LAYOUT, layout)];
        messages.extend(attributes(&dataset.attrs)?);
        self.object_header(&messages)
    }

    /// A single-level-or-more B-tree over `children`, each given with the
    /// heap offset of the last name it holds. Returns the root address.
    fn btree(&mut self, children: Vec<(u64, u64)>) -> PortResult<u64> {
        let fanout = 2 * GROUP_INTERNAL_K;
        let mut level = 0u8;
        let mut nodes = children;
        loop {
            let chunks: Vec<&[(u64, u64)]> = if nodes.is_empty() { vec![&nodes[..]] } else { nodes.chunks(fanout).collect() };
            let start = self.pos();
            let address = |ix: usize| start + (ix * BTREE_NODE_SIZE) as u64;
            let mut parents = vec![];
            let mut left_key = 0;
            for (ix, chunk) in chunks.iter().enumerate() {
                let addr = self.pos();
                self.buf.extend(b"TREE");
                self.buf.extend([0, level]);
                self.buf.write_u16::<LE>(chunk.len() as u16)?;
                self.buf.write_u64::<LE>(if ix > 0 { address(ix - 1) } else { UNDEFINED_ADDRESS })?;
                self.buf.write_u64::<LE>(if ix + 1 < chunks.len() { address(ix + 1) } else { UNDEFINED_ADDRESS })?;
                self.buf.write_u64::<LE>(left_key)?;
                for (child, key) in chunk.iter() {
                    self.buf.write_u64::<LE>(*child)?;
                    self.buf.write_u64::<LE>(*key)?;
                }
                self.pad_to(addr + BTREE_NODE_SIZE as u64);
                let right_key = chunk.last().map(|c| c.1).unwrap_or(left_key);
                parents.push((addr, right_key));
                left_key = right_key;
            }
            if parents.len() == 1 {
                return Ok(parents[0].0);
            }
            nodes = parents;
            level += 1;
        }
    }

    fn group(&mut self, group: &Group) -> PortResult<GroupAddresses> {
        let mut members = vec![];
        for (name, member) in &group.members {
            let (header, scratch) = match member {
                Member::Group(g) => {
                    let addrs = self.group(g).with_context(|| format!("Writing group {name}"))?;
                    (addrs.header, Some((addrs.btree, addrs.heap)))
                }
                Member::Dataset(d) => (self.dataset(d).with_context(|| format!("Writing dataset {name}"))?, None),
            };
            members.push((name, header, scratch));
        }

        // offset 0 of the heap is the empty name
        let mut heap_data = vec![0u8; 8];
        let mut entries = vec![];
        for (name, header, scratch) in members {
            entries.push(SymbolEntry { name_offset: heap_data.len() as u64, header, scratch });
            padded(&mut heap_data, &c_string(name)?);
        }
        let heap = self.pos();
        self.buf.extend(b"HEAP");
        self.buf.extend([0, 0, 0, 0]);
        self.buf.write_u64::<LE>(heap_data.len() as u64)?;
        // no free block
        self.buf.write_u64::<LE>(1)?;
        self.buf.write_u64::<LE>(heap + 32)?;
        self.buf.extend(&heap_data);

        let mut leaves = vec![];
        for chunk in entries.chunks(2 * GROUP_LEAF_K) {
            let addr = self.pos();
            self.buf.extend(b"SNOD");
            self.buf.extend([1, 0]);
            self.buf.write_u16::<LE>(chunk.len() as u16)?;
            for entry in chunk {
                self.symbol_entry(entry)?;
            }
            self.pad_to(addr + SYMBOL_NODE_SIZE as u64);
            let last = chunk.last().map(|e| e.name_offset).unwrap_or(0);
            leaves.push((addr, last));
        }
        let btree = self.btree(leaves)?;

        let mut table = vec![];
        table.write_u64::<LE>(btree)?;
        table.write_u64::<LE>(heap)?;
        let mut messages = vec![(msg::SYMBOL_TABLE, table)];
        messages.extend(attributes(&group.attrs)?);
        let header = self.object_header(&messages)?;
        Ok(GroupAddresses { header, btree, heap })
    }
}

pub fn write_bytes(root: &Group) -> PortResult<Vec<u8>> {
    let mut w = Writer { buf: vec![0; SUPERBLOCK_SIZE] };
    let root = w.group(root)?;
    let eof = w.pos();

    let mut sb = Writer::default();
    sb.buf.extend(SIGNATURE);
    // superblock, free-space, root entry and shared header versions; offset
    // and length sizes
    sb.buf.extend([0, 0, 0, 0, 0, 8, 8, 0]);
    sb.buf.write_u16::<LE>(GROUP_LEAF_K as u16)?;
    sb.buf.write_u16::<LE>(GROUP_INTERNAL_K as u16)?;
    sb.buf.write_u32::<LE>(0)?;
    sb.buf.write_u64::<LE>(0)?;
    sb.buf.write_u64::<LE>(UNDEFINED_ADDRESS)?;
    sb.buf.write_u64::<LE>(eof)?;
    sb.buf.write_u64::<LE>(UNDEFINED_ADDRESS)?;
    sb.symbol_entry(&SymbolEntry { name_offset: 0, header: root.header, scratch: Some((root.btree, root.heap)) })?;
    ensure!(sb.buf.len() == SUPERBLOCK_SIZE, "Superblock is {} bytes", sb.buf.len());
    w.buf[..SUPERBLOCK_SIZE].copy_from_slice(&sb.buf);
    Ok(w.buf)
}

/// Writes `root` as an HDF5 file, returning the file size.
pub fn write(path: impl AsRef<Path>, root: &Group) -> PortResult<u64> {
    let path = path.as_ref();
    let bytes = write_bytes(root)?;
    fs_err::write(path, &bytes)?;
    debug!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_layout() {
        let bytes = write_bytes(&Group::default()).unwrap();
        assert_eq!(&bytes[..8], SIGNATURE);
        assert_eq!(bytes[13], 8);
        assert_eq!(bytes[14], 8);
        let eof = u64::from_le_bytes(bytes[40..48].try_into().unwrap());
        assert_eq!(eof, bytes.len() as u64);
        // heap, then one empty B-tree node, then the root object header
        assert_eq!(&bytes[96..100], b"HEAP");
        assert_eq!(&bytes[96 + 32 + 8..96 + 32 + 12], b"TREE");
    }

    #[test]
    fn attribute_message_layout() {
        let a = attribute("format", "modelport").unwrap();
        assert_eq!(a[0], 1);
        assert_eq!(u16::from_le_bytes([a[2], a[3]]), 7);
        assert_eq!(u16::from_le_bytes([a[4], a[5]]), 8);
        assert_eq!(&a[8..14], b"format");
        assert_eq!(&a[a.len() - 10..], b"modelport\0");
    }

    #[test]
    fn strings_refuse_nul() {
        let mut g = Group::default();
        g.set_attr("bad", "a\0b");
        assert!(write_bytes(&g).is_err());
    }
}
