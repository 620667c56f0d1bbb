use thiserror::Error;

use crate::redis::StreamEntry;

pub const ORDER_NUMBER_FIELD: &str = "order_number";
pub const ITEM_NAME_FIELD: &str = "item_name";
pub const QUANTITY_FIELD: &str = "quantity";

/// Enumeration of errors for malformed order entries. A producer bug or a
/// foreign writer on the stream; the consumer treats these as poison pills.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseOrderError {
    #[error("entry is missing the {0} field")]
    MissingField(&'static str),
    #[error("{0} is not a valid quantity")]
    InvalidQuantity(String),
}

/// An order as appended to the stream by producers. The order number is the
/// de-duplication key: at most one processed record may exist for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub order_number: String,
    pub item_name: String,
    pub quantity: i32,
}

impl Order {
    /// Parse an order out of a stream entry's field/value pairs.
    pub fn from_entry(entry: &StreamEntry) -> Result<Order, ParseOrderError> {
        let field = |name: &'static str| {
            entry
                .fields
                .iter()
                .find(|(n, _)| n.as_str() == name)
                .map(|(_, v)| v.as_str())
                .ok_or(ParseOrderError::MissingField(name))
        };

        let order_number = field(ORDER_NUMBER_FIELD)?.to_owned();
        let item_name = field(ITEM_NAME_FIELD)?.to_owned();
        let quantity = field(QUANTITY_FIELD)?;
        let quantity = quantity
            .parse::<i32>()
            .map_err(|_| ParseOrderError::InvalidQuantity(quantity.to_owned()))?;

        Ok(Order {
            order_number,
            item_name,
            quantity,
        })
    }

    /// The wire representation used by producers, matching `from_entry`.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (ORDER_NUMBER_FIELD.to_owned(), self.order_number.clone()),
            (ITEM_NAME_FIELD.to_owned(), self.item_name.clone()),
            (QUANTITY_FIELD.to_owned(), self.quantity.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fields: Vec<(&str, &str)>) -> StreamEntry {
        StreamEntry {
            id: "1-0".to_string(),
            fields: fields
                .into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn parses_a_well_formed_entry() {
        let parsed = Order::from_entry(&entry(vec![
            ("order_number", "ORD-00042"),
            ("item_name", "Item 7"),
            ("quantity", "3"),
        ]))
        .unwrap();

        assert_eq!(
            parsed,
            Order {
                order_number: "ORD-00042".to_string(),
                item_name: "Item 7".to_string(),
                quantity: 3,
            }
        );
    }

    #[test]
    fn round_trips_through_fields() {
        let order = Order {
            order_number: "ORD-00001".to_string(),
            item_name: "Item 1".to_string(),
            quantity: 12,
        };
        let entry = StreamEntry {
            id: "1-0".to_string(),
            fields: order.to_fields(),
        };

        assert_eq!(Order::from_entry(&entry).unwrap(), order);
    }

    #[test]
    fn rejects_missing_fields() {
        let err = Order::from_entry(&entry(vec![("order_number", "ORD-00042")])).unwrap_err();
        assert_eq!(err, ParseOrderError::MissingField("item_name"));
    }

    #[test]
    fn rejects_a_non_numeric_quantity() {
        let err = Order::from_entry(&entry(vec![
            ("order_number", "ORD-00042"),
            ("item_name", "Item 7"),
            ("quantity", "many"),
        ]))
        .unwrap_err();
        assert_eq!(err, ParseOrderError::InvalidQuantity("many".to_string()));
    }
}
