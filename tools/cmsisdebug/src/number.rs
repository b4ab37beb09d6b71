//! Number arguments: `0x` hex, `0b` binary or decimal, `_` allowed as a separator

use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{digit1, one_of},
    combinator::{all_consuming, map_res, recognize},
    multi::{many0, many1},
    sequence::{pair, preceded},
    IResult,
};

fn radix_digits<'a>(
    digits: &'static str,
    radix: u32,
) -> impl FnMut(&'a str) -> IResult<&'a str, u64> {
    map_res(recognize(many1(one_of(digits))), move |s: &str| {
        u64::from_str_radix(&s.replace('_', ""), radix)
    })
}

fn hex(input: &str) -> IResult<&str, u64> {
    preceded(tag_no_case("0x"), radix_digits("0123456789abcdefABCDEF_", 16))(input)
}

fn bin(input: &str) -> IResult<&str, u64> {
    preceded(tag_no_case("0b"), radix_digits("01_", 2))(input)
}

fn dec(input: &str) -> IResult<&str, u64> {
    map_res(
        recognize(pair(digit1, many0(one_of("0123456789_")))),
        |s: &str| s.replace('_', "").parse::<u64>(),
    )(input)
}

fn number(input: &str) -> Result<u64, String> {
    all_consuming(alt((hex, bin, dec)))(input.trim())
        .map(|(_, value)| value)
        .map_err(|_| format!("`{input}` is not a number (expected 0x.., 0b.. or decimal)"))
}

pub fn parse_u32(input: &str) -> Result<u32, String> {
    let value = number(input)?;
    u32::try_from(value).map_err(|_| format!("{value:#x} does not fit in 32 bits"))
}

pub fn parse_u16(input: &str) -> Result<u16, String> {
    let value = number(input)?;
    u16::try_from(value).map_err(|_| format!("{value:#x} does not fit in 16 bits"))
}
