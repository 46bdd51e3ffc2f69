// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operators as composable channel transformers.
//!
//! Every operator turns a `Channel<T>` into a `Channel<Output>`. Operators are composed with
//! [`OperatorExt::and_then`] and applied with [`Channel::apply`], independent of the channel they
//! will eventually transform.
use crate::channel::Channel;

pub trait Operator<T> {
    type Output;

    fn apply(&self, input: Channel<T>) -> Channel<Self::Output>;
}

pub trait OperatorExt<T>: Operator<T> + Sized {
    /// Applies `next` to the output of this operator.
    fn and_then<O>(self, next: O) -> Chain<Self, O>
    where
        O: Operator<Self::Output>,
    {
        Chain::new(self, next)
    }
}

impl<O, T> OperatorExt<T> for O where O: Operator<T> {}

impl<O, T> Operator<T> for &O
where
    O: Operator<T>,
{
    type Output = O::Output;

    fn apply(&self, input: Channel<T>) -> Channel<Self::Output> {
        O::apply(*self, input)
    }
}

pub struct Chain<O1, O2> {
    first: O1,
    second: O2,
}

impl<O1, O2> Chain<O1, O2> {
    pub fn new(first: O1, second: O2) -> Self {
        Self { first, second }
    }
}

impl<O1, O2, T> Operator<T> for Chain<O1, O2>
where
    O1: Operator<T>,
    O2: Operator<O1::Output>,
{
    type Output = O2::Output;

    fn apply(&self, input: Channel<T>) -> Channel<Self::Output> {
        self.second.apply(self.first.apply(input))
    }
}

impl<T: Send + 'static> Channel<T> {
    pub fn apply<O>(self, operator: O) -> Channel<O::Output>
    where
        O: Operator<T>,
    {
        operator.apply(self)
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::Channel;
    use crate::flat_map::FlatMap;
    use crate::window::Buffer;

    use super::{Operator, OperatorExt};

    struct Doubled;

    impl Operator<u64> for Doubled {
        type Output = u64;

        fn apply(&self, input: Channel<u64>) -> Channel<u64> {
            input.map(|value| value * 2)
        }
    }

    #[tokio::test]
    async fn operator_chaining() {
        let operator = Doubled
            .and_then(Buffer::new(2))
            .and_then(FlatMap::new(
                |batch: Vec<u64>| Channel::just([batch.iter().sum::<u64>()]),
                1,
            ));

        let result = Channel::range(1, 5).apply(operator).collect().await;
        assert_eq!(result, Ok(vec![6, 14, 10]));
    }

    #[tokio::test]
    async fn operators_are_reusable() {
        let operator = Doubled.and_then(Doubled);
        assert_eq!(Channel::range(1, 2).apply(&operator).collect().await, Ok(vec![4, 8]));
        assert_eq!(Channel::range(3, 1).apply(&operator).collect().await, Ok(vec![12]));
    }
}
