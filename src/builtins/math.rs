//! libc math built-ins, delegated to the host float library.

use super::ArgReader;
use crate::cpu::Cpu;
use crate::machine::VmError;

macro_rules! unary_f64 {
    ($($name:ident => $method:ident),* $(,)?) => {
        $(
            // double $name(double x)
            pub(crate) fn $name(cpu: &mut Cpu) -> Result<(), VmError> {
                let x = ArgReader::new(cpu).f64();
                cpu.ret_f64(x.$method());
                Ok(())
            }
        )*
    };
}

unary_f64! {
    sin => sin,
    cos => cos,
    tan => tan,
    sinh => sinh,
    cosh => cosh,
    tanh => tanh,
    asin => asin,
    acos => acos,
    atan => atan,
    exp => exp,
    log => ln,
    log10 => log10,
    sqrt => sqrt,
    floor => floor,
    ceil => ceil,
    fabs => abs,
}

// double pow(double x, double y)
pub(crate) fn pow(cpu: &mut Cpu) -> Result<(), VmError> {
    let (x, y) = {
        let mut a = ArgReader::new(cpu);
        (a.f64(), a.f64())
    };
    cpu.ret_f64(x.powf(y));
    Ok(())
}

// double copysign(double x, double y)
pub(crate) fn copysign(cpu: &mut Cpu) -> Result<(), VmError> {
    let (x, y) = {
        let mut a = ArgReader::new(cpu);
        (a.f64(), a.f64())
    };
    cpu.ret_f64(x.copysign(y));
    Ok(())
}

// double round(double x) -- C99 rounds half away from zero
pub(crate) fn round(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).f64();
    cpu.ret_f64(x.round());
    Ok(())
}

// int isinf(double x)
pub(crate) fn isinf(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).f64();
    cpu.ret_i32(x.is_infinite() as i32);
    Ok(())
}

// int isinff(float x)
pub(crate) fn isinff(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).f32();
    cpu.ret_i32(x.is_infinite() as i32);
    Ok(())
}

// int signbit(double x)
pub(crate) fn signbit(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).f64();
    cpu.ret_i32(x.is_sign_negative() as i32);
    Ok(())
}

// int signbitf(float x)
pub(crate) fn signbitf(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).f32();
    cpu.ret_i32(x.is_sign_negative() as i32);
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_round_half_away_from_zero() {
        // The handler delegates to f64::round, which implements exactly the
        // C99 contract; pin it here so a host regression is caught.
        assert_eq!(0.5f64.round(), 1.0);
        assert_eq!((-0.5f64).round(), -1.0);
        assert_eq!(2.5f64.round(), 3.0);
    }
}
