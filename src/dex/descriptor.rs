//! Helpers over type descriptors such as `I`, `[J` and `Ljava/lang/String;`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Not,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
}

impl PrimitiveType {
    pub fn from_descriptor_char(c: u8) -> PrimitiveType {
        match c {
            b'Z' => PrimitiveType::Boolean,
            b'B' => PrimitiveType::Byte,
            b'C' => PrimitiveType::Char,
            b'S' => PrimitiveType::Short,
            b'I' => PrimitiveType::Int,
            b'J' => PrimitiveType::Long,
            b'F' => PrimitiveType::Float,
            b'D' => PrimitiveType::Double,
            b'V' => PrimitiveType::Void,
            _ => PrimitiveType::Not,
        }
    }

    pub fn from_descriptor(descriptor: &str) -> PrimitiveType {
        return match descriptor.as_bytes().first() {
            Some(c) => Self::from_descriptor_char(*c),
            None => PrimitiveType::Not,
        };
    }

    pub fn descriptor(&self) -> &'static str {
        match self {
            PrimitiveType::Boolean => "Z",
            PrimitiveType::Byte => "B",
            PrimitiveType::Char => "C",
            PrimitiveType::Short => "S",
            PrimitiveType::Int => "I",
            PrimitiveType::Long => "J",
            PrimitiveType::Float => "F",
            PrimitiveType::Double => "D",
            PrimitiveType::Void => "V",
            PrimitiveType::Not => "",
        }
    }

    pub fn is_64bit(&self) -> bool {
        return matches!(self, PrimitiveType::Long | PrimitiveType::Double);
    }
}

pub fn is_array_descriptor(descriptor: &str) -> bool {
    return descriptor.starts_with('[');
}

pub fn is_reference_descriptor(descriptor: &str) -> bool {
    return descriptor.starts_with('L') || descriptor.starts_with('[');
}

/// `[[I` -> `[I`.
pub fn component_descriptor(descriptor: &str) -> Option<&str> {
    return descriptor.strip_prefix('[').filter(|c| !c.is_empty());
}

/// Strips all array dimensions.
pub fn element_descriptor(descriptor: &str) -> &str {
    return descriptor.trim_start_matches('[');
}

/// Human readable form: `Ljava/lang/String;` -> `java.lang.String`, `[I` -> `int[]`.
pub fn pretty_descriptor(descriptor: &str) -> String {
    let element = element_descriptor(descriptor);
    let dims = descriptor.len() - element.len();
    let mut result = match PrimitiveType::from_descriptor(element) {
        PrimitiveType::Boolean => "boolean".to_string(),
        PrimitiveType::Byte => "byte".to_string(),
        PrimitiveType::Char => "char".to_string(),
        PrimitiveType::Short => "short".to_string(),
        PrimitiveType::Int => "int".to_string(),
        PrimitiveType::Long => "long".to_string(),
        PrimitiveType::Float => "float".to_string(),
        PrimitiveType::Double => "double".to_string(),
        PrimitiveType::Void => "void".to_string(),
        PrimitiveType::Not => {
            let name = element
                .strip_prefix('L')
                .and_then(|s| s.strip_suffix(';'))
                .unwrap_or(element);
            name.replace('/', ".")
        }
    };
    for _ in 0..dims {
        result.push_str("[]");
    }
    return result;
}

/// `java.lang.String` -> `Ljava/lang/String;`. Array names are already
/// descriptors apart from the dots.
pub fn dot_to_descriptor(class_name: &str) -> String {
    let slashed = class_name.replace('.', "/");
    if slashed.starts_with('[') {
        return slashed;
    }
    return format!("L{};", slashed);
}

fn package_of(descriptor: &str) -> &str {
    let element = element_descriptor(descriptor);
    return match element.rfind('/') {
        Some(pos) => &element[..pos],
        None => "",
    };
}

/// Two descriptors name classes in the same runtime package when their
/// element types share everything up to the last `/`.
pub fn is_same_package(descriptor1: &str, descriptor2: &str) -> bool {
    let pkg1 = package_of(descriptor1);
    let pkg2 = package_of(descriptor2);
    let pkg1 = pkg1.strip_prefix('L').unwrap_or(pkg1);
    let pkg2 = pkg2.strip_prefix('L').unwrap_or(pkg2);
    return pkg1 == pkg2;
}

fn next_type(s: &str) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    let mut end = 0;
    while end < bytes.len() && bytes[end] == b'[' {
        end += 1;
    }
    match bytes.get(end)? {
        b'L' => {
            let semi = s[end..].find(';')?;
            end += semi + 1;
        }
        c if PrimitiveType::from_descriptor_char(*c) != PrimitiveType::Not => end += 1,
        _ => return None,
    }
    return Some(s.split_at(end));
}

/// Splits `(IJLjava/lang/String;)V` into parameter and return descriptors.
pub fn parse_signature(signature: &str) -> Option<(Vec<&str>, &str)> {
    let rest = signature.strip_prefix('(')?;
    let close = rest.find(')')?;
    let (mut params_str, ret) = (&rest[..close], &rest[close + 1..]);
    let mut params = Vec::new();
    while !params_str.is_empty() {
        let (param, rest) = next_type(params_str)?;
        params.push(param);
        params_str = rest;
    }
    let (ret_type, tail) = next_type(ret)?;
    if !tail.is_empty() {
        return None;
    }
    return Some((params, ret_type));
}

/// Compact signature: one char per type, references collapsed to `L`,
/// return type first.
pub fn shorty(signature: &str) -> Option<String> {
    let (params, ret) = parse_signature(signature)?;
    let mut result = String::with_capacity(params.len() + 1);
    for descriptor in std::iter::once(ret).chain(params.into_iter()) {
        if is_reference_descriptor(descriptor) {
            result.push('L');
        } else {
            result.push(descriptor.as_bytes()[0] as char);
        }
    }
    return Some(result);
}

#[cfg(test)]
mod tests {
    use super::{
        component_descriptor, dot_to_descriptor, is_same_package, parse_signature,
        pretty_descriptor, shorty, PrimitiveType,
    };

    #[test]
    fn primitive_descriptor_chars() {
        assert_eq!(PrimitiveType::from_descriptor("I"), PrimitiveType::Int);
        assert_eq!(PrimitiveType::from_descriptor("J"), PrimitiveType::Long);
        assert_eq!(PrimitiveType::from_descriptor("Ljava/lang/Object;"), PrimitiveType::Not);
        assert!(PrimitiveType::Double.is_64bit());
        assert!(!PrimitiveType::Int.is_64bit());
    }

    #[test]
    fn pretty_names() {
        assert_eq!(pretty_descriptor("Ljava/lang/String;"), "java.lang.String");
        assert_eq!(pretty_descriptor("[[I"), "int[][]");
        assert_eq!(pretty_descriptor("[Ljava/lang/Object;"), "java.lang.Object[]");
        assert_eq!(dot_to_descriptor("java.lang.String"), "Ljava/lang/String;");
        assert_eq!(dot_to_descriptor("[I"), "[I");
    }

    #[test]
    fn component_of_array() {
        assert_eq!(component_descriptor("[[I"), Some("[I"));
        assert_eq!(component_descriptor("[Ljava/lang/String;"), Some("Ljava/lang/String;"));
        assert_eq!(component_descriptor("I"), None);
        assert_eq!(component_descriptor("["), None);
    }

    #[test]
    fn package_comparison() {
        assert!(is_same_package("Ljava/lang/String;", "Ljava/lang/Object;"));
        assert!(is_same_package("[Ljava/lang/String;", "Ljava/lang/Object;"));
        assert!(!is_same_package("Ljava/lang/String;", "Ljava/lang/ref/Reference;"));
        assert!(is_same_package("LFoo;", "LBar;"));
        assert!(is_same_package("[I", "LBar;"));
        assert!(!is_same_package("LFoo;", "Lcom/Bar;"));
    }

    #[test]
    fn signatures() {
        let (params, ret) = parse_signature("(I[JLjava/lang/String;)V").unwrap();
        assert_eq!(params, vec!["I", "[J", "Ljava/lang/String;"]);
        assert_eq!(ret, "V");
        assert_eq!(shorty("(I[JLjava/lang/String;)Z").unwrap(), "ZILL");
        assert!(parse_signature("(Q)V").is_none());
        assert!(parse_signature("()").is_none());
    }
}
