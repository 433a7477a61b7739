//! Field and method descriptors (JVMS 4.3)

use crate::Error;

/// A field type in a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// `B`
    Byte,
    /// `C`
    Char,
    /// `D`
    Double,
    /// `F`
    Float,
    /// `I`
    Int,
    /// `J`
    Long,
    /// `S`
    Short,
    /// `Z`
    Boolean,
    /// `Lname;`, holding the internal name
    Object(String),
    /// `[...`, holding the full array descriptor
    Array(String),
}

impl FieldType {
    /// Number of local variable / operand stack slots a value of this type takes
    #[must_use]
    pub fn slots(&self) -> u16 {
        match self {
            Self::Double | Self::Long => 2,
            _ => 1,
        }
    }

    /// Parses one field type starting at `input`, returning it and the unparsed rest.
    fn parse_prefix(input: &str) -> Result<(Self, &str), Error> {
        let invalid = || Error::structural(format!("invalid descriptor `{input}`"));
        let mut chars = input.chars();
        let first = chars.next().ok_or_else(invalid)?;
        let rest = chars.as_str();
        let ty = match first {
            'B' => Self::Byte,
            'C' => Self::Char,
            'D' => Self::Double,
            'F' => Self::Float,
            'I' => Self::Int,
            'J' => Self::Long,
            'S' => Self::Short,
            'Z' => Self::Boolean,
            'L' => {
                let end = rest.find(';').ok_or_else(invalid)?;
                if end == 0 {
                    return Err(invalid());
                }
                return Ok((Self::Object(rest[..end].to_string()), &rest[end + 1..]));
            }
            '[' => {
                let mut dims = 1;
                let mut element = rest;
                while let Some(stripped) = element.strip_prefix('[') {
                    dims += 1;
                    element = stripped;
                }
                if dims > 255 {
                    return Err(invalid());
                }
                let (_, after) = Self::parse_prefix(element)?;
                let consumed = input.len() - after.len();
                return Ok((Self::Array(input[..consumed].to_string()), after));
            }
            _ => return Err(invalid()),
        };
        Ok((ty, rest))
    }

    /// Parses a complete field descriptor
    pub fn parse(descriptor: &str) -> Result<Self, Error> {
        let (ty, rest) = Self::parse_prefix(descriptor)?;
        if rest.is_empty() {
            Ok(ty)
        } else {
            Err(Error::structural(format!(
                "trailing characters in field descriptor `{descriptor}`"
            )))
        }
    }
}

/// A parsed method descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Parameter types, in order
    pub params: Vec<FieldType>,
    /// Return type, `None` for `V`
    pub ret: Option<FieldType>,
}

impl MethodDescriptor {
    /// Parses `(params)ret`
    pub fn parse(descriptor: &str) -> Result<Self, Error> {
        let invalid = || Error::structural(format!("invalid method descriptor `{descriptor}`"));
        let mut rest = descriptor.strip_prefix('(').ok_or_else(invalid)?;
        let mut params = vec![];
        while !rest.starts_with(')') {
            if rest.is_empty() {
                return Err(invalid());
            }
            let (param, after) = FieldType::parse_prefix(rest)?;
            params.push(param);
            rest = after;
        }
        let ret = match &rest[1..] {
            "V" => None,
            ret => Some(FieldType::parse(ret)?),
        };
        Ok(Self { params, ret })
    }

    /// Slots taken by the parameters, not counting `this`
    #[must_use]
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(FieldType::slots).sum()
    }
}
