use std::{
    fmt,
    marker::PhantomData,
    ops::Deref,
    sync::Arc,
};

use super::UniqueIdentifier;

/// Loop I/O data wrapper
///
/// `U` is the data unique identifier (UID).
/// The data is shared behind an [Arc] pointer so handing it over
/// from one client to the next never copies it.
pub struct Data<U: UniqueIdentifier>(
    Arc<<U as UniqueIdentifier>::DataType>,
    PhantomData<U>,
);
impl<T, U: UniqueIdentifier<DataType = T>> Deref for Data<U> {
    type Target = T;
    /// Returns a reference to the data
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T, U: UniqueIdentifier<DataType = T>> Clone for Data<U> {
    /// Makes a clone of the inner `Arc` pointer
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0), PhantomData)
    }
}

impl<T, U> From<Data<U>> for Vec<T>
where
    T: Clone,
    U: UniqueIdentifier<DataType = Vec<T>>,
{
    /// Unwraps the vector, cloning it only if the pointer is still shared
    fn from(data: Data<U>) -> Self {
        Arc::try_unwrap(data.0).unwrap_or_else(|arc| (*arc).clone())
    }
}
impl<T, U: UniqueIdentifier<DataType = Vec<T>>> From<Vec<T>> for Data<U> {
    fn from(u: Vec<T>) -> Self {
        Data(Arc::new(u), PhantomData)
    }
}
impl<T, U> fmt::Debug for Data<U>
where
    T: fmt::Debug,
    U: UniqueIdentifier<DataType = T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Data").field(&self.0).finish()
    }
}

impl<T: Default, U: UniqueIdentifier<DataType = T>> Default for Data<U> {
    fn default() -> Self {
        Self(Default::default(), PhantomData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Command {}
    impl UniqueIdentifier for Command {
        type DataType = Vec<f64>;
    }

    #[test]
    fn shared_until_unwrapped() {
        let data = Data::<Command>::from(vec![1., 2.]);
        let alias = data.clone();
        assert!(std::ptr::eq(&*data, &*alias));
        assert_eq!(*data, vec![1., 2.]);
        drop(data);
        let v: Vec<f64> = alias.into();
        assert_eq!(v, vec![1., 2.]);
    }
}
