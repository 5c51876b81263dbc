//! Printf-Family Format Engine
//!
//! Interprets a guest format string one byte at a time against the guest
//! argument area, which grows downward from the anchor just below the format
//! argument. Literal bytes collect in an output buffer that is flushed to the
//! target on every newline and at the end of the format; the return value is
//! the byte count, or -1 once the target reports an I/O error.
//!
//! Supported conversions: d i u o x X c s p f e g %, with the `-`, `+`,
//! space, `#` and `0` flags, `*`/numeric width and precision, and `l`
//! length prefixes (one `l` selects the model's long width, two or more
//! select 64 bits).

use std::io;

use crate::memory::{MemoryMap, StackSizes};

/// Where formatted bytes go.
pub(crate) trait FormatTarget {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// Guest-memory sink for sprintf.
pub(crate) struct MemoryTarget<'a> {
    mem: &'a MemoryMap,
    addr: u64,
}

impl<'a> MemoryTarget<'a> {
    pub fn new(mem: &'a MemoryMap, addr: u64) -> Self {
        Self { mem, addr }
    }

    /// Terminate the guest string.
    pub fn finish(self) {
        self.mem.write_u8(self.addr, 0);
    }
}

impl FormatTarget for MemoryTarget<'_> {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.mem.write_bytes(self.addr, buf);
        self.addr += buf.len() as u64;
        Ok(())
    }
}

/// Downward cursor over the variadic argument area.
pub(crate) struct VarArgs<'a> {
    mem: &'a MemoryMap,
    sz: StackSizes,
    cursor: u64,
}

impl<'a> VarArgs<'a> {
    /// `anchor` is the address of the last named argument's slot; the first
    /// variadic argument lives one slot below it.
    pub fn new(mem: &'a MemoryMap, sz: StackSizes, anchor: u64) -> Self {
        Self { mem, sz, cursor: anchor }
    }

    fn i32(&mut self) -> i32 {
        self.cursor -= self.sz.i32 as u64;
        self.mem.read_i32(self.cursor)
    }

    fn i64(&mut self) -> i64 {
        self.cursor -= self.sz.i64 as u64;
        self.mem.read_i64(self.cursor)
    }

    fn long(&mut self) -> i64 {
        self.cursor -= self.sz.long as u64;
        self.mem.read_long(self.cursor)
    }

    fn f64(&mut self) -> f64 {
        self.cursor -= self.sz.f64 as u64;
        self.mem.read_f64(self.cursor)
    }

    fn ptr(&mut self) -> u64 {
        self.cursor -= self.sz.ptr as u64;
        self.mem.read_ptr(self.cursor)
    }
}

#[derive(Default, Clone, Copy)]
struct Flags {
    minus: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
}

/// Run the format. Returns bytes written, or -1 on target I/O error.
pub(crate) fn format(
    mem: &MemoryMap,
    fmt: u64,
    args: &mut VarArgs,
    target: &mut dyn FormatTarget,
) -> i32 {
    match run(mem, fmt, args, target) {
        Ok(n) => n as i32,
        Err(_) => -1,
    }
}

fn run(
    mem: &MemoryMap,
    fmt: u64,
    args: &mut VarArgs,
    target: &mut dyn FormatTarget,
) -> io::Result<usize> {
    let mut out: Vec<u8> = Vec::new();
    let mut written = 0usize;
    let mut p = fmt;

    loop {
        let b = mem.read_u8(p);
        p += 1;
        match b {
            0 => break,
            b'%' => {
                let spec = parse_spec(mem, &mut p, args);
                render(mem, spec, args, &mut out);
            }
            _ => {
                out.push(b);
                if b == b'\n' {
                    written += out.len();
                    target.write_all(&out)?;
                    out.clear();
                }
            }
        }
    }

    written += out.len();
    target.write_all(&out)?;
    Ok(written)
}

struct Spec {
    flags: Flags,
    width: Option<usize>,
    precision: Option<usize>,
    longs: u8,
    conv: u8,
}

fn parse_spec(mem: &MemoryMap, p: &mut u64, args: &mut VarArgs) -> Spec {
    let mut flags = Flags::default();
    let mut width = None;
    let mut precision = None;
    let mut longs = 0u8;

    // Flags.
    loop {
        match mem.read_u8(*p) {
            b'-' => flags.minus = true,
            b'+' => flags.plus = true,
            b' ' => flags.space = true,
            b'0' => flags.zero = true,
            b'#' => flags.alt = true,
            _ => break,
        }
        *p += 1;
    }

    // Width.
    if mem.read_u8(*p) == b'*' {
        *p += 1;
        let w = args.i32();
        if w < 0 {
            flags.minus = true;
            width = Some(w.unsigned_abs() as usize);
        } else {
            width = Some(w as usize);
        }
    } else {
        width = scan_number(mem, p).or(width);
    }

    // Precision.
    if mem.read_u8(*p) == b'.' {
        *p += 1;
        if mem.read_u8(*p) == b'*' {
            *p += 1;
            let w = args.i32();
            precision = if w < 0 { None } else { Some(w as usize) };
        } else {
            precision = Some(scan_number(mem, p).unwrap_or(0));
        }
    }

    // Length prefixes; only `l` changes operand width here.
    loop {
        match mem.read_u8(*p) {
            b'l' => longs += 1,
            b'h' => {}
            _ => break,
        }
        *p += 1;
    }

    let conv = mem.read_u8(*p);
    if conv != 0 {
        *p += 1;
    }

    Spec { flags, width, precision, longs, conv }
}

fn scan_number(mem: &MemoryMap, p: &mut u64) -> Option<usize> {
    let mut v: Option<usize> = None;
    loop {
        let b = mem.read_u8(*p);
        if !b.is_ascii_digit() {
            return v;
        }
        v = Some(v.unwrap_or(0) * 10 + (b - b'0') as usize);
        *p += 1;
    }
}

fn render(mem: &MemoryMap, spec: Spec, args: &mut VarArgs, out: &mut Vec<u8>) {
    match spec.conv {
        b'd' | b'i' => {
            let v = match spec.longs {
                0 => args.i32() as i64,
                1 => args.long(),
                _ => args.i64(),
            };
            push_int(out, &spec, v < 0, v.unsigned_abs(), 10, false);
        }
        b'u' | b'o' | b'x' | b'X' => {
            let v = match spec.longs {
                0 => args.i32() as u32 as u64,
                1 => {
                    let l = args.long();
                    if args.sz.long == 4 {
                        l as u32 as u64
                    } else {
                        l as u64
                    }
                }
                _ => args.i64() as u64,
            };
            let radix = match spec.conv {
                b'o' => 8,
                b'u' => 10,
                _ => 16,
            };
            push_int(out, &spec, false, v, radix, spec.conv == b'X');
        }
        b'c' => {
            let c = args.i32() as u8;
            push_padded(out, &spec, &[c], b"");
        }
        b's' => {
            let p = args.ptr();
            let mut s = if p == 0 {
                b"(null)".to_vec()
            } else {
                mem.c_string(p)
            };
            if let Some(prec) = spec.precision {
                s.truncate(prec);
            }
            push_padded(out, &spec, &s, b"");
        }
        b'p' => {
            let p = args.ptr();
            let body = format!("{:x}", p).into_bytes();
            push_padded(out, &spec, &body, b"0x");
        }
        b'f' => {
            let v = args.f64();
            let prec = spec.precision.unwrap_or(6);
            push_float(out, &spec, format!("{:.*}", prec, v));
        }
        b'e' => {
            let v = args.f64();
            let prec = spec.precision.unwrap_or(6);
            push_float(out, &spec, exp_notation(v, prec));
        }
        b'g' => {
            let v = args.f64();
            push_float(out, &spec, general_notation(v, &spec));
        }
        b'%' => out.push(b'%'),
        other => {
            // Unknown conversion: emit it verbatim.
            out.push(b'%');
            if other != 0 {
                out.push(other);
            }
        }
    }
}

/// Digits + sign + padding for the integer conversions.
fn push_int(out: &mut Vec<u8>, spec: &Spec, negative: bool, magnitude: u64, radix: u32, upper: bool) {
    let mut digits = match radix {
        8 => format!("{:o}", magnitude),
        16 if upper => format!("{:X}", magnitude),
        16 => format!("{:x}", magnitude),
        _ => format!("{}", magnitude),
    };
    if let Some(prec) = spec.precision {
        while digits.len() < prec {
            digits.insert(0, '0');
        }
        if magnitude == 0 && prec == 0 {
            digits.clear();
        }
    }

    let mut prefix = Vec::new();
    if negative {
        prefix.push(b'-');
    } else if spec.flags.plus {
        prefix.push(b'+');
    } else if spec.flags.space {
        prefix.push(b' ');
    }
    if spec.flags.alt && magnitude != 0 {
        match radix {
            8 => prefix.push(b'0'),
            16 => prefix.extend_from_slice(if upper { b"0X" } else { b"0x" }),
            _ => {}
        }
    }

    // `0` pads between sign and digits, unless left-justified or an explicit
    // precision already fixed the digit count.
    if spec.flags.zero && !spec.flags.minus && spec.precision.is_none() {
        if let Some(w) = spec.width {
            while prefix.len() + digits.len() < w {
                digits.insert(0, '0');
            }
        }
    }

    let body = digits.into_bytes();
    push_padded_with_prefix(out, spec, &prefix, &body);
}

fn push_float(out: &mut Vec<u8>, spec: &Spec, rendered: String) {
    let mut body = rendered.into_bytes();
    let mut prefix = Vec::new();
    if body.first() == Some(&b'-') {
        body.remove(0);
        prefix.push(b'-');
    } else if spec.flags.plus {
        prefix.push(b'+');
    } else if spec.flags.space {
        prefix.push(b' ');
    }

    if spec.flags.zero && !spec.flags.minus {
        if let Some(w) = spec.width {
            while prefix.len() + body.len() < w {
                body.insert(0, b'0');
            }
        }
    }
    push_padded_with_prefix(out, spec, &prefix, &body);
}

fn push_padded(out: &mut Vec<u8>, spec: &Spec, body: &[u8], prefix: &[u8]) {
    push_padded_with_prefix(out, spec, prefix, body);
}

fn push_padded_with_prefix(out: &mut Vec<u8>, spec: &Spec, prefix: &[u8], body: &[u8]) {
    let len = prefix.len() + body.len();
    let width = spec.width.unwrap_or(0);
    if spec.flags.minus {
        out.extend_from_slice(prefix);
        out.extend_from_slice(body);
        out.resize(out.len() + width.saturating_sub(len), b' ');
    } else {
        out.resize(out.len() + width.saturating_sub(len), b' ');
        out.extend_from_slice(prefix);
        out.extend_from_slice(body);
    }
}

/// C `%e`: mantissa with `prec` fraction digits, exponent of at least two
/// digits with a sign.
fn exp_notation(v: f64, prec: usize) -> String {
    let s = format!("{:.*e}", prec, v);
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let e: i32 = exp.parse().unwrap_or(0);
            format!("{}e{}{:02}", mantissa, if e < 0 { '-' } else { '+' }, e.abs())
        }
        None => s,
    }
}

/// C `%g`: choose `%e` or `%f` by exponent, then drop trailing zeros
/// (unless `#`).
fn general_notation(v: f64, spec: &Spec) -> String {
    let p = spec.precision.unwrap_or(6).max(1);
    let exp = if v == 0.0 || !v.is_finite() {
        0
    } else {
        v.abs().log10().floor() as i32
    };

    let mut s = if exp < -4 || exp >= p as i32 {
        exp_notation(v, p - 1)
    } else {
        let prec = (p as i32 - 1 - exp).max(0) as usize;
        format!("{:.*}", prec, v)
    };

    if !spec.flags.alt && s.contains('.') {
        // Trim trailing zeros in the fraction; mind the exponent suffix.
        let (mantissa, suffix) = match s.split_once('e') {
            Some((m, e)) => (m.to_string(), format!("e{}", e)),
            None => (s.clone(), String::new()),
        };
        let trimmed = mantissa.trim_end_matches('0').trim_end_matches('.');
        s = format!("{}{}", trimmed, suffix);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::MemoryModel;
    use crate::memory::{MappedRegion, Mapping, MemoryMap, RegionKind, StackSizes};

    struct VecTarget(Vec<u8>);

    impl FormatTarget for VecTarget {
        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.0.extend_from_slice(buf);
            Ok(())
        }
    }

    /// Lay out a format string and its argument area in one mapping, the
    /// way a caller's stack frame would.
    fn scratch() -> (MemoryMap, Mapping, StackSizes) {
        let mapping = Mapping::anonymous(1 << 16).unwrap();
        let mem = MemoryMap::new(MemoryModel::M64);
        mem.register(MappedRegion {
            base: mapping.base(),
            size: mapping.len(),
            kind: RegionKind::Stack,
            writable: true,
        });
        let sz = StackSizes::of(MemoryModel::M64);
        (mem, mapping, sz)
    }

    fn run_fmt(fmt: &str, write_args: impl Fn(&MemoryMap, u64)) -> String {
        let (mem, mapping, sz) = scratch();
        let base = mapping.base();
        let fmt_addr = base + 1024;
        mem.write_bytes(fmt_addr, fmt.as_bytes());
        mem.write_u8(fmt_addr + fmt.len() as u64, 0);

        // Argument slots below the anchor.
        let anchor = base + 512;
        write_args(&mem, anchor);

        let mut args = VarArgs::new(&mem, sz, anchor);
        let mut target = VecTarget(Vec::new());
        let n = format(&mem, fmt_addr, &mut args, &mut target);
        assert_eq!(n as usize, target.0.len());
        String::from_utf8(target.0).unwrap()
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(run_fmt("hello\n", |_, _| {}), "hello\n");
    }

    #[test]
    fn test_decimal_and_string() {
        let s = run_fmt("n=%d, s=%s\n", |mem, anchor| {
            mem.write_i32(anchor - 8, 42);
            // The string itself lives higher in the mapping.
            mem.write_bytes(anchor + 256, b"hi\0");
            mem.write_u64(anchor - 16, anchor + 256);
        });
        assert_eq!(s, "n=42, s=hi\n");
    }

    #[test]
    fn test_width_and_zero_pad() {
        let s = run_fmt("[%5d][%-5d][%05d]", |mem, anchor| {
            mem.write_i32(anchor - 8, 42);
            mem.write_i32(anchor - 16, 42);
            mem.write_i32(anchor - 24, 42);
        });
        assert_eq!(s, "[   42][42   ][00042]");
    }

    #[test]
    fn test_hex_octal_alt() {
        let s = run_fmt("%#x %#o %X", |mem, anchor| {
            mem.write_i32(anchor - 8, 255);
            mem.write_i32(anchor - 16, 8);
            mem.write_i32(anchor - 24, 255);
        });
        assert_eq!(s, "0xff 010 FF");
    }

    #[test]
    fn test_negative_and_plus_flag() {
        let s = run_fmt("%d %+d", |mem, anchor| {
            mem.write_i32(anchor - 8, -7);
            mem.write_i32(anchor - 16, 7);
        });
        assert_eq!(s, "-7 +7");
    }

    #[test]
    fn test_star_width() {
        let s = run_fmt("[%*d]", |mem, anchor| {
            mem.write_i32(anchor - 8, 6); // width
            mem.write_i32(anchor - 16, 42);
        });
        assert_eq!(s, "[    42]");
    }

    #[test]
    fn test_char_and_percent() {
        let s = run_fmt("%c%%", |mem, anchor| {
            mem.write_i32(anchor - 8, 'A' as i32);
        });
        assert_eq!(s, "A%");
    }

    #[test]
    fn test_float() {
        let s = run_fmt("%f %.2f %e", |mem, anchor| {
            mem.write_f64(anchor - 8, 1.5);
            mem.write_f64(anchor - 16, 2.125);
            mem.write_f64(anchor - 24, 1500.0);
        });
        assert_eq!(s, "1.500000 2.12 1.500000e+03");
    }

    #[test]
    fn test_g_trims_zeros() {
        let s = run_fmt("%g %g", |mem, anchor| {
            mem.write_f64(anchor - 8, 0.5);
            mem.write_f64(anchor - 16, 100000000.0);
        });
        assert_eq!(s, "0.5 1e+08");
    }

    #[test]
    fn test_long_width_modifier() {
        let s = run_fmt("%ld %lld", |mem, anchor| {
            mem.write_i64(anchor - 8, -1);
            mem.write_i64(anchor - 16, 1i64 << 40);
        });
        assert_eq!(s, format!("-1 {}", 1i64 << 40));
    }

    #[test]
    fn test_string_precision() {
        let s = run_fmt("%.3s", |mem, anchor| {
            mem.write_bytes(anchor + 256, b"abcdef\0");
            mem.write_u64(anchor - 8, anchor + 256);
        });
        assert_eq!(s, "abc");
    }

    #[test]
    fn test_null_string() {
        let s = run_fmt("%s", |mem, anchor| {
            mem.write_u64(anchor - 8, 0);
        });
        assert_eq!(s, "(null)");
    }

    #[test]
    fn test_memory_target_sprintf_style() {
        let (mem, mapping, sz) = scratch();
        let base = mapping.base();
        let fmt_addr = base + 1024;
        mem.write_bytes(fmt_addr, b"x=%d\0");
        mem.write_i32(base + 504, 9);

        let mut args = VarArgs::new(&mem, sz, base + 512);
        let dst = base + 2048;
        let mut target = MemoryTarget::new(&mem, dst);
        let n = format(&mem, fmt_addr, &mut args, &mut target);
        target.finish();

        assert_eq!(n, 3);
        assert_eq!(mem.c_string(dst), b"x=9");
    }
}
