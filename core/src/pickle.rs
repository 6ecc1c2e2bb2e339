//! Just enough of a protocol 2 pickler to describe a torch state dict.
use byteorder::{LittleEndian, WriteBytesExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Proto = 0x80,
    Global = b'c',
    EmptyTuple = b')',
    Reduce = b'R',
    Mark = b'(',
    BinUnicode = b'X',
    BinInt = b'J',
    BinInt1 = b'K',
    BinInt2 = b'M',
    Long1 = 0x8a,
    Tuple = b't',
    BinPersId = b'Q',
    NewFalse = 0x89,
    SetItems = b'u',
    Stop = b'.',
}

#[derive(Debug, Default)]
pub struct Pickler {
    buf: Vec<u8>,
}

impl Pickler {
    pub fn new() -> Pickler {
        let mut p = Pickler::default();
        p.op(OpCode::Proto);
        p.buf.push(2);
        p
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.buf.push(op as u8);
        self
    }

    pub fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.op(OpCode::Global);
        self.buf.extend_from_slice(module.as_bytes());
        self.buf.push(b'\n');
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b'\n');
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.op(OpCode::BinUnicode);
        // writing into a Vec never fails
        let _ = self.buf.write_u32::<LittleEndian>(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn int(&mut self, i: i64) -> &mut Self {
        if (0..=0xff).contains(&i) {
            self.op(OpCode::BinInt1);
            self.buf.push(i as u8);
        } else if (0..=0xffff).contains(&i) {
            self.op(OpCode::BinInt2);
            let _ = self.buf.write_u16::<LittleEndian>(i as u16);
        } else if i32::try_from(i).is_ok() {
            self.op(OpCode::BinInt);
            let _ = self.buf.write_i32::<LittleEndian>(i as i32);
        } else {
            self.op(OpCode::Long1);
            self.buf.push(8);
            let _ = self.buf.write_i64::<LittleEndian>(i);
        }
        self
    }

    /// Pushes a tuple of ints.
    pub fn int_tuple(&mut self, values: &[usize]) -> &mut Self {
        if values.is_empty() {
            return self.op(OpCode::EmptyTuple);
        }
        self.op(OpCode::Mark);
        for &v in values {
            self.int(v as i64);
        }
        self.op(OpCode::Tuple)
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.op(OpCode::Stop);
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ints() {
        let mut p = Pickler::default();
        p.int(7).int(300).int(-1).int(1 << 40);
        assert_eq!(
            p.buf,
            [
                &[b'K', 7][..],
                &[b'M', 0x2c, 0x01],
                &[b'J', 0xff, 0xff, 0xff, 0xff],
                &[0x8a, 8, 0, 0, 0, 0, 0, 1, 0, 0]
            ]
            .concat()
        );
    }

    #[test]
    fn header_and_stop() {
        let mut p = Pickler::new();
        p.global("collections", "OrderedDict");
        let bytes = p.finish();
        assert_eq!(&bytes[..2], &[0x80, 2]);
        assert_eq!(&bytes[2..], b"ccollections\nOrderedDict\n.");
    }
}
