use std::collections::HashSet;

use byteorder::{ByteOrder, LittleEndian as LE};
use memmap2::Mmap;

use super::*;

enum Shape {
    Simple(TVec<usize>),
    Null,
}

enum ElementType {
    Numeric(DatumType),
    String(usize),
}

struct Reader<'a> {
    data: &'a [u8],
    /// Object headers on the path from the root, to refuse cyclic links.
    visiting: HashSet<u64>,
}

fn c_str(bytes: &[u8]) -> PortResult<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(std::str::from_utf8(&bytes[..end]).context("Invalid UTF-8 string")?.to_string())
}

fn dataspace(data: &[u8]) -> PortResult<Shape> {
    ensure!(data.len() >= 4, "Truncated dataspace message");
    let (version, rank) = (data[0], data[1] as usize);
    let dims_at = match version {
        1 => 8,
        2 => {
            if data[3] == 2 {
                return Ok(Shape::Null);
            }
            4
        }
        v => bail!("Unsupported dataspace version {v}"),
    };
    ensure!(data.len() >= dims_at + 8 * rank, "Truncated dataspace message");
    Ok(Shape::Simple((0..rank).map(|i| LE::read_u64(&data[dims_at + 8 * i..]) as usize).collect()))
}

fn datatype(data: &[u8]) -> PortResult<ElementType> {
    ensure!(data.len() >= 8, "Truncated datatype message");
    let class = data[0] & 0x0f;
    let bits = data[1];
    let size = LE::read_u32(&data[4..]) as usize;
    match class {
        0 | 1 => ensure!(bits & 0x01 == 0, "Big-endian data is not supported"),
        _ => (),
    }
    let dt = match (class, size) {
        (0, 8) if bits & 0x08 != 0 => DatumType::I64,
        (1, 4) => DatumType::F32,
        (3, size) => return Ok(ElementType::String(size)),
        (class, size) => bail!("Unsupported datatype (class {class}, {size} bytes)"),
    };
    Ok(ElementType::Numeric(dt))
}

impl<'a> Reader<'a> {
    fn slice(&self, at: u64, len: usize) -> PortResult<&'a [u8]> {
        let start = at as usize;
        let end = start.checked_add(len).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => Ok(&self.data[start..end]),
            None => bail!("Reading {len} bytes at {at:#x} overruns the file ({} bytes)", self.data.len()),
        }
    }

    fn u64_at(&self, at: u64) -> PortResult<u64> {
        Ok(LE::read_u64(self.slice(at, 8)?))
    }

    fn magic(&self, at: u64, magic: &[u8; 4]) -> PortResult<()> {
        ensure!(
            self.slice(at, 4)? == magic,
            "Expected {} at {at:#x}",
            String::from_utf8_lossy(magic)
        );
        Ok(())
    }

    /// Messages of a version 1 object header, continuation blocks included.
    fn messages(&self, addr: u64) -> PortResult<Vec<(u16, &'a [u8])>> {
        let prefix = self.slice(addr, 16)?;
        ensure!(prefix[0] == 1, "Unsupported object header version {} at {addr:#x}", prefix[0]);
        let count = LE::read_u16(&prefix[2..]) as usize;
        let mut blocks = vec![(addr + 16, LE::read_u32(&prefix[8..]) as usize)];
        let mut messages = vec![];
        while let Some((start, len)) = blocks.pop() {
            let block = self.slice(start, len)?;
            let mut at = 0;
            while at + 8 <= block.len() && messages.len() < count {
                let kind = LE::read_u16(&block[at..]);
                let size = LE::read_u16(&block[at + 2..]) as usize;
                let data = block.get(at + 8..at + 8 + size).context("Header message overruns its block")?;
                if kind == msg::CONTINUATION {
                    ensure!(data.len() >= 16, "Truncated continuation message");
                    blocks.push((LE::read_u64(data), LE::read_u64(&data[8..]) as usize));
                }
                messages.push((kind, data));
                at += 8 + size;
            }
        }
        Ok(messages)
    }

    fn attribute(&self, data: &[u8]) -> PortResult<Option<(String, String)>> {
        ensure!(data.len() >= 8, "Truncated attribute message");
        let version = data[0];
        let name_len = LE::read_u16(&data[2..]) as usize;
        let dt_len = LE::read_u16(&data[4..]) as usize;
        let ds_len = LE::read_u16(&data[6..]) as usize;
        // version 1 pads each field to 8 bytes, version 3 adds an encoding byte
        let (mut at, padded) = match version {
            1 => (8, true),
            2 => (8, false),
            3 => (9, false),
            v => bail!("Unsupported attribute version {v}"),
        };
        let mut field = |len: usize| {
            let bytes = data.get(at..at + len).context("Truncated attribute message");
            at += if padded { pad8(len) } else { len };
            bytes
        };
        let name = c_str(field(name_len)?)?;
        let dt = field(dt_len)?;
        let ds = field(ds_len)?;
        // numeric and variable-length attributes carry nothing we read back
        let size = match datatype(dt) {
            Ok(ElementType::String(size)) => size,
            Ok(ElementType::Numeric(_)) => {
                debug!("Skipping non-string attribute {name}");
                return Ok(None);
            }
            Err(e) => {
                debug!("Skipping attribute {name}: {e}");
                return Ok(None);
            }
        };
        ensure!(matches!(dataspace(ds)?, Shape::Simple(ref s) if s.is_empty()), "Attribute {name} is not a scalar");
        let value = data.get(at..at + size).with_context(|| format!("Truncated value for attribute {name}"))?;
        Ok(Some((name, c_str(value)?)))
    }

    fn object(&mut self, addr: u64) -> PortResult<Member> {
        ensure!(self.visiting.insert(addr), "Cyclic group structure through {addr:#x}");
        let member = self.object_inner(addr);
        self.visiting.remove(&addr);
        member
    }

    fn object_inner(&mut self, addr: u64) -> PortResult<Member> {
        let mut attrs = BTreeMap::new();
        let mut table = None;
        let (mut shape, mut element, mut layout) = (None, None, None);
        for (kind, data) in self.messages(addr)? {
            match kind {
                msg::SYMBOL_TABLE => {
                    ensure!(data.len() >= 16, "Truncated symbol table message");
                    table = Some((LE::read_u64(data), LE::read_u64(&data[8..])));
                }
                msg::ATTRIBUTE => attrs.extend(self.attribute(data)?),
                msg::DATASPACE => shape = Some(dataspace(data)?),
                msg::DATATYPE => element = Some(datatype(data)?),
                msg::LAYOUT => layout = Some(data),
                msg::NIL | msg::CONTINUATION | msg::FILL_VALUE | msg::MODIFICATION_TIME => (),
                other => trace!("Ignoring header message {other:#x} at {addr:#x}"),
            }
        }
        if let Some((btree, heap)) = table {
            let members = self.group_members(btree, heap)?;
            return Ok(Member::Group(Group { attrs, members }));
        }
        let (Some(shape), Some(element), Some(layout)) = (shape, element, layout) else {
            bail!("Object at {addr:#x} is neither a group nor a dataset");
        };
        let bytes = self.layout(layout)?;
        let value = match (element, shape) {
            (ElementType::String(size), Shape::Simple(s)) if s.is_empty() => {
                Value::String(c_str(bytes.get(..size).context("Truncated string dataset")?)?)
            }
            (ElementType::Numeric(dt), Shape::Simple(s)) => Value::Tensor(Tensor::from_le_bytes(dt, &s, bytes)?),
            (ElementType::Numeric(dt), Shape::Null) => Value::Tensor(Tensor::from_le_bytes(dt, &[0], &[])?),
            _ => bail!("Only scalar string datasets are supported"),
        };
        Ok(Member::Dataset(Dataset { value, attrs }))
    }

    fn layout(&self, data: &'a [u8]) -> PortResult<&'a [u8]> {
        ensure!(data.len() >= 2 && data[0] == 3, "Unsupported layout message");
        match data[1] {
            0 => {
                let size = LE::read_u16(data.get(2..4).context("Truncated layout")?) as usize;
                data.get(4..4 + size).context("Truncated compact dataset")
            }
            1 => {
                let fields = data.get(2..18).context("Truncated layout")?;
                let (address, size) = (LE::read_u64(fields), LE::read_u64(&fields[8..]) as usize);
                if address == UNDEFINED_ADDRESS {
                    ensure!(size == 0, "Unallocated dataset of {size} bytes");
                    return Ok(&[]);
                }
                self.slice(address, size)
            }
            class => bail!("Unsupported layout class {class}"),
        }
    }

    fn group_members(&mut self, btree: u64, heap: u64) -> PortResult<BTreeMap<String, Member>> {
        self.magic(heap, b"HEAP")?;
        let heap_size = self.u64_at(heap + 8)? as usize;
        let heap_data = self.slice(self.u64_at(heap + 24)?, heap_size)?;

        let mut entries = vec![];
        self.btree_entries(btree, &mut entries, 0)?;
        let mut members = BTreeMap::new();
        for (name_offset, header) in entries {
            let name = c_str(heap_data.get(name_offset as usize..).context("Name offset outside of heap")?)?;
            let member = self.object(header).with_context(|| format!("Reading {name}"))?;
            ensure!(members.insert(name.clone(), member).is_none(), "Duplicate link {name}");
        }
        Ok(members)
    }

    fn btree_entries(&self, addr: u64, entries: &mut Vec<(u64, u64)>, depth: usize) -> PortResult<()> {
        ensure!(depth < 64, "B-tree too deep at {addr:#x}");
        self.magic(addr, b"TREE")?;
        let header = self.slice(addr, 24)?;
        ensure!(header[4] == 0, "Not a group B-tree at {addr:#x}");
        let level = header[5];
        let children = LE::read_u16(&header[6..]) as u64;
        for i in 0..children {
            let child = self.u64_at(addr + 24 + 8 + 16 * i)?;
            if level > 0 {
                self.btree_entries(child, entries, depth + 1)?;
            } else {
                self.magic(child, b"SNOD")?;
                let count = LE::read_u16(self.slice(child + 6, 2)?) as u64;
                for e in 0..count {
                    let entry = child + 8 + e * SYMBOL_ENTRY_SIZE as u64;
                    entries.push((self.u64_at(entry)?, self.u64_at(entry + 8)?));
                }
            }
        }
        Ok(())
    }
}

pub fn read_bytes(data: &[u8]) -> PortResult<Group> {
    ensure!(data.len() >= SUPERBLOCK_SIZE && &data[..8] == SIGNATURE, "Not an HDF5 file");
    ensure!(data[8] == 0, "Unsupported superblock version {}", data[8]);
    ensure!(data[13] == 8 && data[14] == 8, "Only 8-byte offsets and lengths are supported");
    let mut reader = Reader { data, visiting: HashSet::new() };
    let root = reader.u64_at(56 + 8)?;
    match reader.object(root)? {
        Member::Group(g) => Ok(g),
        Member::Dataset(_) => bail!("Root object is not a group"),
    }
}

/// Reads a whole HDF5 file back into memory.
pub fn read(path: impl AsRef<Path>) -> PortResult<Group> {
    let path = path.as_ref();
    let file = fs_err::File::open(path)?;
    // Safety: the map is read-only and dropped before returning.
    let map = unsafe { Mmap::map(file.file()) }.with_context(|| format!("Mapping {}", path.display()))?;
    read_bytes(&map).with_context(|| format!("Reading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Group {
        let mut root = Group::default();
        root.set_attr("format", "modelport");
        root.set_attr("empty", "");
        root.add_dataset("config", Dataset::new(Value::String("{\"a\": 1}".into()))).unwrap();
        let weights = root.add_group("weights").unwrap();
        weights
            .add_dataset("w", Dataset::new(Value::Tensor(Tensor::from_shape(&[2, 3], vec![1f32, 2., 3., 4., 5., 6.]).unwrap())))
            .unwrap();
        weights.add_dataset("ids", Dataset::new(Value::Tensor(Tensor::vector(&[7i64, -1])))).unwrap();
        weights.add_dataset("nothing", Dataset::new(Value::Tensor(Tensor::zero::<f32>(&[0, 4])))).unwrap();
        weights.add_group("inner").unwrap().set_attr("deep", "yes");
        root
    }

    #[test]
    fn reads_back_what_was_written() {
        let group = sample();
        let bytes = write_bytes(&group).unwrap();
        assert_eq!(read_bytes(&bytes).unwrap(), group);
    }

    #[test]
    fn through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.h5");
        let group = sample();
        let len = write(&path, &group).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
        assert_eq!(read(&path).unwrap(), group);
    }

    #[test]
    fn garbage_is_refused() {
        assert!(read_bytes(b"not an hdf5 file at all").is_err());
        let mut bytes = write_bytes(&sample()).unwrap();
        bytes.truncate(bytes.len() - 40);
        assert!(read_bytes(&bytes).is_err());
    }

    #[test]
    fn self_referencing_groups_are_refused() {
        let mut root = Group::default();
        root.add_group("a").unwrap();
        let mut bytes = write_bytes(&root).unwrap();
        // point the only link of the root group back at the root header
        let root_header = LE::read_u64(&bytes[64..]);
        let snod = bytes.windows(4).position(|w| w == b"SNOD").unwrap();
        LE::write_u64(&mut bytes[snod + 16..], root_header);
        let err = read_bytes(&bytes).unwrap_err();
        assert!(format!("{err:#}").contains("Cyclic"), "{err:#}");
    }

    proptest! {
        #[test]
        fn many_members(names in proptest::collection::btree_set("[a-z]{1,12}", 0..300)) {
            let mut root = Group::default();
            for (ix, name) in names.iter().enumerate() {
                let value = Value::Tensor(Tensor::vector(&[ix as i64]));
                root.add_dataset(name, Dataset::new(value)).unwrap();
            }
            let bytes = write_bytes(&root).unwrap();
            prop_assert_eq!(read_bytes(&bytes).unwrap(), root);
        }
    }
}
