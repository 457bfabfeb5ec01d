//! Opaque pagination cursors for the validator/delegator listing entry
//! points (§4.5 "pagination cursors").

use alloy_primitives::Address;

/// An opaque cursor into an ordered listing. Callers must treat the
/// encoded bytes as meaningless beyond passing them back into the next
/// call; the only guarantee is that round-tripping a cursor resumes
/// exactly where the previous page left off, even if entries were added
/// or removed elsewhere in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    /// Last address returned by the previous page, used as the strict
    /// lower bound for the next one; `None` means start from the
    /// beginning.
    last: Option<Address>,
}

impl Cursor {
    /// The cursor for the first page.
    pub const START: Cursor = Cursor { last: None };

    /// Resume after `addr`.
    pub fn after(addr: Address) -> Self {
        Self { last: Some(addr) }
    }

    /// Encode to the wire representation used by the precompile ABI: 20
    /// zero bytes mean "start", otherwise the 20-byte address itself.
    pub fn encode(&self) -> [u8; 20] {
        self.last.map(|a| a.into_array()).unwrap_or([0u8; 20])
    }

    /// Decode a wire cursor. All-zero bytes decode to [`Cursor::START`].
    pub fn decode(bytes: [u8; 20]) -> Self {
        if bytes == [0u8; 20] {
            Cursor::START
        } else {
            Cursor::after(Address::from(bytes))
        }
    }
}

/// One page of a listing, plus the cursor to request the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// The items in this page, in ascending id order.
    pub items: Vec<T>,
    /// Cursor to pass for the next page; `None` once exhausted.
    pub next: Option<Cursor>,
}

/// Paginate a sorted-by-address slice starting strictly after `cursor`,
/// returning at most `page_size` items.
pub fn paginate<'a, T, F>(sorted: &'a [T], id_of: F, cursor: Cursor, page_size: usize) -> Page<&'a T>
where
    F: Fn(&T) -> Address,
{
    let start = match cursor.last {
        None => 0,
        Some(after) => sorted.partition_point(|item| id_of(item) <= after),
    };
    let end = (start + page_size).min(sorted.len());
    let items: Vec<&T> = sorted[start..end].iter().collect();
    let next = if end < sorted.len() {
        items.last().map(|item| Cursor::after(id_of(item)))
    } else {
        None
    };
    Page { items, next }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::from(bytes)
    }

    #[test]
    fn cursor_roundtrips_through_wire_encoding() {
        let cur = Cursor::after(addr(5));
        assert_eq!(Cursor::decode(cur.encode()), cur);
        assert_eq!(Cursor::decode([0u8; 20]), Cursor::START);
    }

    #[test]
    fn pagination_resumes_after_cursor() {
        let items: Vec<Address> = (1..=5).map(addr).collect();
        let page1 = paginate(&items, |a| *a, Cursor::START, 2);
        assert_eq!(page1.items.len(), 2);
        let next = page1.next.unwrap();
        let page2 = paginate(&items, |a| *a, next, 2);
        assert_eq!(page2.items, vec![&addr(3), &addr(4)]);
    }

    #[test]
    fn pagination_is_stable_across_insertions() {
        let mut items: Vec<Address> = (1..=5).map(addr).collect();
        let page1 = paginate(&items, |a| *a, Cursor::START, 2);
        let next = page1.next.unwrap();
        items.insert(0, addr(0));
        let page2 = paginate(&items, |a| *a, next, 2);
        assert_eq!(page2.items, vec![&addr(3), &addr(4)]);
    }
}
