mod tests_full_row;
