//! Total order over tagged values.
use dicom_core::Tag;
use std::cmp::Ordering;

/// A value identified by a DICOM attribute tag.
pub trait Tagged {
    /// The tag identifying this value.
    fn tag(&self) -> Tag;
}

impl Tagged for Tag {
    fn tag(&self) -> Tag {
        *self
    }
}

impl<T: Tagged + ?Sized> Tagged for &T {
    fn tag(&self) -> Tag {
        (**self).tag()
    }
}

/// Pack a tag into its 32-bit numeric form, group first.
pub fn tag_value(tag: Tag) -> u32 {
    (u32::from(tag.group()) << 16) | u32::from(tag.element())
}

/// Compare two optional tagged values.
///
/// Tags are compared as unsigned 32-bit numbers.
/// An absent value always orders before any present value.
pub fn compare<T: Tagged + ?Sized>(a: Option<&T>, b: Option<&T>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => tag_value(a.tag()).cmp(&tag_value(b.tag())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Tag(0x0008, 0x0018), Tag(0x0020, 0x000D))]
    #[case(Tag(0x0010, 0x0010), Tag(0x0010, 0x0020))]
    #[case(Tag(0x7FE0, 0x0010), Tag(0xFFFE, 0xE000))]
    #[case(Tag(0x0000, 0xFFFF), Tag(0x0001, 0x0000))]
    fn compare_is_antisymmetric(#[case] low: Tag, #[case] high: Tag) {
        assert_eq!(compare(Some(&low), Some(&high)), Ordering::Less);
        assert_eq!(compare(Some(&high), Some(&low)), Ordering::Greater);
        assert_eq!(compare(Some(&low), Some(&low)), Ordering::Equal);
    }

    #[test]
    fn absent_orders_first() {
        let tag = Tag(0x0000, 0x0000);
        assert_eq!(compare(Some(&tag), None), Ordering::Greater);
        assert_eq!(compare(None, Some(&tag)), Ordering::Less);
        assert_eq!(compare::<Tag>(None, None), Ordering::Equal);
    }

    #[test]
    fn high_groups_compare_unsigned() {
        // 0xFFFE would be negative as a signed 16-bit group
        assert!(tag_value(Tag(0xFFFE, 0xE0DD)) > tag_value(Tag(0x7FE0, 0x0010)));
    }
}
